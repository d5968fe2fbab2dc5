//! 采集阶段: 视频源 → 原始帧队列

use tracing::{error, info, warn};

use super::stats::{PipelineStats, StageMeter};
use super::StopHandle;
use crate::detection::Frame;
use crate::input::{SourceSpecs, VideoSource};
use crate::queue::BoundedQueue;

/// 连续解码失败超过该次数视为流结束
pub const MAX_CONSECUTIVE_DECODE_ERRORS: u32 = 30;

pub(crate) struct Ingest<'a> {
    pub source: &'a mut dyn VideoSource,
    pub raw: &'a BoundedQueue<Frame>,
    pub device_id: &'a str,
    pub specs: &'a SourceSpecs,
    pub stride: u64,
    pub max_frames: Option<u64>,
    pub stop: &'a StopHandle,
    pub stats: &'a PipelineStats,
}

impl Ingest<'_> {
    /// 源帧序号从1开始, 直接作为帧ID; 保留满足 `(index - 1) % stride == 0` 的帧
    pub fn run(mut self) {
        info!("📥 采集线程启动 (采样间隔: {})", self.stride);
        let stride = self.stride.max(1);
        let mut meter = StageMeter::new("采集");
        let mut index: u64 = 0;
        let mut failures: u32 = 0;

        loop {
            if self.stop.is_stopped() {
                info!("🛑 收到停止信号");
                self.source.stop();
                break;
            }

            let decoded = self.source.decode_next();
            match decoded {
                Ok(Some(image)) => {
                    index += 1;
                    failures = 0;
                    if (index - 1) % stride != 0 {
                        PipelineStats::bump(&self.stats.sampled_out);
                        continue;
                    }
                    let frame = Frame::new(self.device_id, index, self.specs.offset_ms(index), image);
                    self.raw.enqueue(frame);
                    PipelineStats::bump(&self.stats.ingested);
                    meter.tick();

                    if self.max_frames.is_some_and(|max| meter.total() >= max) {
                        info!("⏹️  已采集 {} 帧, 达到上限", meter.total());
                        self.source.stop();
                        break;
                    }
                }
                Ok(None) => {
                    info!("📭 视频源结束");
                    break;
                }
                Err(e) => {
                    // 失败的帧也占用一个源序号, 保持帧ID与源位置一致
                    index += 1;
                    failures += 1;
                    PipelineStats::bump(&self.stats.decode_errors);
                    warn!(frame = index, "⚠️ 解码失败: {}", e);
                    if failures >= MAX_CONSECUTIVE_DECODE_ERRORS {
                        error!("❌ 连续 {} 次解码失败, 结束采集", failures);
                        self.source.stop();
                        break;
                    }
                }
            }
        }
        info!("📥 采集线程退出 (共 {} 帧)", meter.total());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::SyntheticSource;

    fn run_ingest(source: &mut dyn VideoSource, stride: u64, max_frames: Option<u64>) -> Vec<u64> {
        let specs = source.open("synthetic://").unwrap();
        let raw = BoundedQueue::new(64);
        let stop = StopHandle::default();
        let stats = PipelineStats::default();
        Ingest {
            source,
            raw: &raw,
            device_id: "cam",
            specs: &specs,
            stride,
            max_frames,
            stop: &stop,
            stats: &stats,
        }
        .run();
        std::iter::from_fn(|| raw.try_dequeue())
            .map(|f| f.frame_id)
            .collect()
    }

    #[test]
    fn test_stride_keeps_every_nth_frame() {
        let mut source = SyntheticSource::new(4, 4, 10, 25.0);
        assert_eq!(run_ingest(&mut source, 3, None), vec![1, 4, 7, 10]);
    }

    #[test]
    fn test_max_frames_counts_sampled_frames() {
        let mut source = SyntheticSource::new(4, 4, 100, 25.0);
        assert_eq!(run_ingest(&mut source, 2, Some(3)), vec![1, 3, 5]);
    }

    struct Flaky {
        calls: u32,
    }

    impl VideoSource for Flaky {
        fn open(&mut self, _uri: &str) -> anyhow::Result<SourceSpecs> {
            Ok(SourceSpecs {
                width: 2,
                height: 2,
                frame_rate: 10.0,
                frame_count: None,
            })
        }

        fn decode_next(&mut self) -> anyhow::Result<Option<image::RgbImage>> {
            self.calls += 1;
            match self.calls {
                2 => anyhow::bail!("corrupt packet"),
                1 | 3 => Ok(Some(image::RgbImage::new(2, 2))),
                _ => anyhow::bail!("stream broken"),
            }
        }

        fn stop(&mut self) {}
    }

    #[test]
    fn test_decode_errors_are_skipped_then_give_up() {
        let mut source = Flaky { calls: 0 };
        assert_eq!(run_ingest(&mut source, 1, None), vec![1, 3]);
        assert_eq!(source.calls, 3 + MAX_CONSECUTIVE_DECODE_ERRORS);
    }

    #[test]
    fn test_stop_handle_ends_ingest() {
        let mut source = SyntheticSource::new(4, 4, 10, 25.0);
        let specs = source.open("synthetic://").unwrap();
        let raw = BoundedQueue::new(4);
        let stop = StopHandle::default();
        stop.stop();
        Ingest {
            source: &mut source,
            raw: &raw,
            device_id: "cam",
            specs: &specs,
            stride: 1,
            max_frames: None,
            stop: &stop,
            stats: &PipelineStats::default(),
        }
        .run();
        assert!(raw.is_empty());
    }
}
