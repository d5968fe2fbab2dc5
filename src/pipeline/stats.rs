//! 运行统计

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;
use tracing::info;

/// 各阶段共享的计数器
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub ingested: AtomicU64,
    pub sampled_out: AtomicU64,
    pub analyzed: AtomicU64,
    pub displayed: AtomicU64,
    pub decode_errors: AtomicU64,
    pub detect_errors: AtomicU64,
    pub track_errors: AtomicU64,
    pub handler_errors: AtomicU64,
}

impl PipelineStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// 运行结束时的汇总
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub frames_ingested: u64,
    pub frames_sampled_out: u64,
    pub frames_analyzed: u64,
    pub frames_displayed: u64,
    pub decode_errors: u64,
    pub detect_errors: u64,
    pub track_errors: u64,
    pub handler_errors: u64,
    pub raw_queue_high_water: usize,
    pub raw_queue_evicted: usize,
    pub analyzed_queue_high_water: usize,
    pub analyzed_queue_evicted: usize,
    pub window_evicted: usize,
    pub snapshots_saved: usize,
}

impl RunSummary {
    pub(crate) fn from_stats(stats: &PipelineStats) -> Self {
        Self {
            frames_ingested: PipelineStats::get(&stats.ingested),
            frames_sampled_out: PipelineStats::get(&stats.sampled_out),
            frames_analyzed: PipelineStats::get(&stats.analyzed),
            frames_displayed: PipelineStats::get(&stats.displayed),
            decode_errors: PipelineStats::get(&stats.decode_errors),
            detect_errors: PipelineStats::get(&stats.detect_errors),
            track_errors: PipelineStats::get(&stats.track_errors),
            handler_errors: PipelineStats::get(&stats.handler_errors),
            ..Default::default()
        }
    }

    pub fn print(&self) {
        info!(
            "📊 采集 {} 帧 (跳过 {}) | 分析 {} | 显示 {}",
            self.frames_ingested, self.frames_sampled_out, self.frames_analyzed, self.frames_displayed
        );
        info!(
            "📊 队列峰值 raw={} analyzed={} | 淘汰 raw={} analyzed={} window={}",
            self.raw_queue_high_water,
            self.analyzed_queue_high_water,
            self.raw_queue_evicted,
            self.analyzed_queue_evicted,
            self.window_evicted
        );
        info!(
            "📊 错误: 解码 {} | 检测 {} | 跟踪 {} | 处理器 {} | 保存截图 {}",
            self.decode_errors,
            self.detect_errors,
            self.track_errors,
            self.handler_errors,
            self.snapshots_saved
        );
    }
}

/// 每秒打印一次吞吐量
pub struct StageMeter {
    stage: &'static str,
    count: u64,
    total: u64,
    last: Instant,
}

impl StageMeter {
    pub fn new(stage: &'static str) -> Self {
        Self {
            stage,
            count: 0,
            total: 0,
            last: Instant::now(),
        }
    }

    pub fn tick(&mut self) {
        self.count += 1;
        self.total += 1;
        let elapsed = self.last.elapsed().as_secs_f64();
        if elapsed >= 1.0 {
            info!(
                "📈 {}: {:.1}fps | 累计 {} 帧",
                self.stage,
                self.count as f64 / elapsed,
                self.total
            );
            self.count = 0;
            self.last = Instant::now();
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_reads_counters() {
        let stats = PipelineStats::default();
        PipelineStats::bump(&stats.ingested);
        PipelineStats::bump(&stats.ingested);
        PipelineStats::bump(&stats.detect_errors);
        let summary = RunSummary::from_stats(&stats);
        assert_eq!(summary.frames_ingested, 2);
        assert_eq!(summary.detect_errors, 1);
        assert_eq!(summary.frames_analyzed, 0);
    }

    #[test]
    fn test_meter_counts_ticks() {
        let mut meter = StageMeter::new("test");
        for _ in 0..5 {
            meter.tick();
        }
        assert_eq!(meter.total(), 5);
    }
}
