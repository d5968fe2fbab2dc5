//! 分析阶段: 原始帧队列 → 检测 → 区域分类 → 跟踪 → 快照 → 处理器 → 滑动窗口 → 分析帧队列
//!
//! 单帧内的处理全部同步执行, 窗口淘汰事件也在本线程发布.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use super::stats::{PipelineStats, StageMeter};
use crate::detection::{Frame, ObjectDetector, ObjectTracker, RegionClassifier};
use crate::handlers::AnalysisHandler;
use crate::queue::BoundedQueue;
use crate::snapshot::SnapshotCache;
use crate::window::SlideWindow;

pub(crate) struct Analyze<'a> {
    pub raw: &'a BoundedQueue<Frame>,
    /// 没有消费者时为 `None`, 帧处理完直接交给窗口
    pub analyzed: Option<&'a BoundedQueue<Arc<Frame>>>,
    pub ingest_done: &'a AtomicBool,
    pub detector: &'a mut dyn ObjectDetector,
    pub region: &'a mut dyn RegionClassifier,
    pub tracker: &'a mut dyn ObjectTracker,
    pub handlers: &'a mut [Box<dyn AnalysisHandler>],
    pub cache: &'a SnapshotCache,
    pub window: &'a SlideWindow,
    pub confidence_threshold: f32,
    pub stats: &'a PipelineStats,
}

impl Analyze<'_> {
    /// 采集结束且队列为空时退出
    pub fn run(mut self) {
        info!("🔍 分析线程启动");
        let mut meter = StageMeter::new("分析");
        loop {
            let finished = self.ingest_done.load(Ordering::Acquire);
            let next = if finished {
                self.raw.try_dequeue()
            } else {
                self.raw.dequeue()
            };
            match next {
                Some(frame) => {
                    self.process(frame);
                    meter.tick();
                }
                None if finished => break,
                None => continue,
            }
        }
        info!("🔍 分析线程退出 (共 {} 帧)", meter.total());
    }

    fn process(&mut self, mut frame: Frame) {
        let image = frame.shared_image();

        frame.objects = match self.detector.detect(&image, self.confidence_threshold) {
            Ok(objects) => objects,
            Err(e) => {
                PipelineStats::bump(&self.stats.detect_errors);
                warn!(frame = frame.frame_id, "⚠️ 检测失败, 按无目标处理: {}", e);
                Vec::new()
            }
        };

        self.region.classify(&mut frame.objects);

        match self.tracker.track(&image, &mut frame.objects) {
            Ok(()) => self.region.observe_tracked(&frame.objects),
            Err(e) => {
                PipelineStats::bump(&self.stats.track_errors);
                warn!(frame = frame.frame_id, "⚠️ 跟踪失败, 丢弃本帧目标: {}", e);
                frame.objects.clear();
            }
        }

        self.cache.update(&mut frame);

        for handler in self.handlers.iter_mut() {
            if let Err(e) = handler.analyze(&mut frame) {
                PipelineStats::bump(&self.stats.handler_errors);
                warn!(frame = frame.frame_id, handler = handler.name(), "⚠️ 处理器失败: {}", e);
            }
        }

        let frame = Arc::new(frame);
        self.window.add_frame(Arc::clone(&frame));
        if let Some(analyzed) = self.analyzed {
            analyzed.enqueue(frame);
        }
        PipelineStats::bump(&self.stats.analyzed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::region::LaneDefinition;
    use crate::detection::{
        IouTracker, NullDetector, PolygonRegions, RecordedDetection, RegionDefinition,
        ReplayDetector, WholeFrame,
    };
    use crate::snapshot::SnapshotConfig;
    use crate::window::ObjectExpired;
    use crate::xbus::XBus;
    use image::RgbImage;
    use std::sync::Mutex;

    struct Failing;

    impl ObjectDetector for Failing {
        fn detect(&mut self, _: &RgbImage, _: f32) -> anyhow::Result<Vec<crate::detection::DetectedObject>> {
            anyhow::bail!("inference error")
        }
    }

    fn raw_frames(n: u64) -> BoundedQueue<Frame> {
        let raw = BoundedQueue::new(16);
        for id in 1..=n {
            raw.enqueue(Frame::new("cam", id, id * 40, RgbImage::new(32, 32)));
        }
        raw
    }

    #[test]
    fn test_frames_flow_through_window_in_order() {
        let bus = XBus::new();
        let expired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&expired);
        let _sub = bus.subscribe::<ObjectExpired, _>(move |ev| sink.lock().unwrap().push(ev.object_id.clone()));

        let raw = raw_frames(3);
        let analyzed = BoundedQueue::new(16);
        let window = SlideWindow::new(2, bus.clone());
        let cache = SnapshotCache::new(SnapshotConfig::default(), None);
        let stats = PipelineStats::default();
        let box_a = RecordedDetection::new("car", 2, 0.9, [0.0, 0.0, 10.0, 10.0]);
        let mut detector = ReplayDetector::new(vec![vec![box_a.clone()], vec![box_a], vec![]]);

        Analyze {
            raw: &raw,
            analyzed: Some(&analyzed),
            ingest_done: &AtomicBool::new(true),
            detector: &mut detector,
            region: &mut WholeFrame,
            tracker: &mut IouTracker::default(),
            handlers: &mut [],
            cache: &cache,
            window: &window,
            confidence_threshold: 0.25,
            stats: &stats,
        }
        .run();

        let ids: Vec<u64> = std::iter::from_fn(|| analyzed.try_dequeue())
            .map(|f| f.frame_id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
        // 帧3淘汰帧1; car:1 仍在帧2中
        assert!(window.is_alive("car:1"));
        assert!(expired.lock().unwrap().is_empty());
        assert_eq!(cache.snapshots_for("car:1").len(), 1);
        assert_eq!(stats.analyzed.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_detection_failure_keeps_frame() {
        let raw = raw_frames(2);
        let window = SlideWindow::new(4, XBus::new());
        let cache = SnapshotCache::new(SnapshotConfig::default(), None);
        let stats = PipelineStats::default();

        Analyze {
            raw: &raw,
            analyzed: None,
            ingest_done: &AtomicBool::new(true),
            detector: &mut Failing,
            region: &mut WholeFrame,
            tracker: &mut IouTracker::default(),
            handlers: &mut [],
            cache: &cache,
            window: &window,
            confidence_threshold: 0.25,
            stats: &stats,
        }
        .run();

        assert_eq!(window.len(), 2);
        assert_eq!(stats.detect_errors.load(Ordering::Relaxed), 2);
        assert_eq!(cache.scene_count(), 2);
    }

    #[test]
    fn test_exits_when_ingest_done_and_empty() {
        let raw = BoundedQueue::new(4);
        let window = SlideWindow::new(4, XBus::new());
        let cache = SnapshotCache::new(SnapshotConfig::default(), None);
        let started = std::time::Instant::now();
        Analyze {
            raw: &raw,
            analyzed: None,
            ingest_done: &AtomicBool::new(true),
            detector: &mut NullDetector,
            region: &mut WholeFrame,
            tracker: &mut IouTracker::default(),
            handlers: &mut [],
            cache: &cache,
            window: &window,
            confidence_threshold: 0.25,
            stats: &PipelineStats::default(),
        }
        .run();
        assert!(started.elapsed() < std::time::Duration::from_millis(400));
    }

    fn analyze_range(
        ids: std::ops::RangeInclusive<u64>,
        detector: &mut dyn ObjectDetector,
        region: &mut dyn RegionClassifier,
        tracker: &mut dyn ObjectTracker,
        window: &SlideWindow,
    ) {
        let raw = BoundedQueue::new(16);
        for id in ids {
            raw.enqueue(Frame::new("cam", id, id * 40, RgbImage::new(64, 48)));
        }
        let cache = SnapshotCache::new(SnapshotConfig::default(), None);
        Analyze {
            raw: &raw,
            analyzed: None,
            ingest_done: &AtomicBool::new(true),
            detector,
            region,
            tracker,
            handlers: &mut [],
            cache: &cache,
            window,
            confidence_threshold: 0.25,
            stats: &PipelineStats::default(),
        }
        .run();
    }

    #[test]
    fn test_polygon_entry_lane_uses_tracked_ids() {
        let bus = XBus::new();
        let whole = RegionDefinition {
            normalized: true,
            lanes: vec![LaneDefinition {
                name: "all".into(),
                points: vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]],
            }],
        };
        let mut regions = PolygonRegions::from_definition(&whole, 64, 48);
        let _subs = regions.on_attach(&bus);
        let window = SlideWindow::new(2, bus.clone());
        let car = RecordedDetection::new("car", 2, 0.9, [10.0, 10.0, 40.0, 40.0]);
        let mut detector = ReplayDetector::new(vec![vec![car.clone()], vec![car.clone()], vec![car]]);
        let mut tracker = IouTracker::default();

        analyze_range(1..=3, &mut detector, &mut regions, &mut tracker, &window);
        assert!(window.is_alive("car:1"));
        assert_eq!(regions.entry_lane("car:1"), Some(0));
        assert_eq!(regions.tracked_entries(), 1);

        // 帧4、5淘汰帧2、3, car:1 过期后入口车道被释放
        analyze_range(4..=5, &mut detector, &mut regions, &mut tracker, &window);
        assert!(!window.is_alive("car:1"));
        assert_eq!(regions.entry_lane("car:1"), None);
        assert_eq!(regions.tracked_entries(), 0);
    }
}
