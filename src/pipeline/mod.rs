/// 视频处理流水线 (Video Processing Pipeline)
///
/// 三线程架构, 通过有界淘汰队列连接:
/// - Ingest:  视频源解码 → 原始帧队列
/// - Analyze: 检测/区域/跟踪/快照/处理器 → 滑动窗口 → 分析帧队列
/// - Display: 调试渲染与帧回调 (可选)
///
/// 状态机: `Idle → Opening → Running → Draining → Closed`
pub mod analyze;
pub mod display;
pub mod ingest;
pub mod stats;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::detection::{
    Frame, IouTracker, NullDetector, ObjectDetector, ObjectTracker, RegionClassifier, WholeFrame,
};
use crate::error::{PipelineError, PipelineResult};
use crate::handlers::AnalysisHandler;
use crate::input::VideoSource;
use crate::queue::BoundedQueue;
use crate::registry::CapabilityRegistry;
use crate::snapshot::{ArtifactStore, SnapshotCache};
use crate::window::SlideWindow;
use crate::xbus::XBus;

pub use display::DebugRenderer;
pub use stats::{PipelineStats, RunSummary, StageMeter};

use analyze::Analyze;
use display::Display;
use ingest::Ingest;

/// 显示阶段的帧回调
pub type FrameSink = Box<dyn FnMut(Arc<Frame>) + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Opening,
    Running,
    Draining,
    Closed,
}

impl PipelineState {
    fn can_enter(self, to: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, to),
            (Idle, Opening) | (Opening, Running) | (Running, Draining) | (Draining, Closed)
        ) || (to == Closed && matches!(self, Opening | Running))
    }
}

/// 一次运行所需的外部组件
pub struct Collaborators {
    pub source: Box<dyn VideoSource>,
    pub detector: Box<dyn ObjectDetector>,
    pub tracker: Box<dyn ObjectTracker>,
    pub region: Box<dyn RegionClassifier>,
    pub handlers: Vec<Box<dyn AnalysisHandler>>,
    pub store: Option<Arc<dyn ArtifactStore>>,
}

impl Collaborators {
    /// 只指定视频源, 其余使用空检测器 / IOU跟踪器 / 全画面区域
    pub fn new(source: Box<dyn VideoSource>) -> Self {
        Self {
            source,
            detector: Box::new(NullDetector),
            tracker: Box::new(IouTracker::default()),
            region: Box::new(WholeFrame),
            handlers: Vec::new(),
            store: None,
        }
    }

    pub fn with_detector(mut self, detector: Box<dyn ObjectDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_tracker(mut self, tracker: Box<dyn ObjectTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_region(mut self, region: Box<dyn RegionClassifier>) -> Self {
        self.region = region;
        self
    }

    pub fn with_handler(mut self, handler: Box<dyn AnalysisHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = Some(store);
        self
    }
}

/// 停止信号, 可在任意线程调用. 采集线程收到后调用视频源的 `stop`.
#[derive(Clone, Debug, Default)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// 交给视频源轮询的共享标志
    pub(crate) fn signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }
}

/// 阶段结束标记. panic 退出时同时发出停止信号, 让其他阶段尽快结束.
struct StageGuard<'a> {
    done: &'a AtomicBool,
    stop: &'a StopHandle,
}

impl Drop for StageGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.stop.stop();
        }
        self.done.store(true, Ordering::Release);
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    collaborators: Option<Collaborators>,
    bus: XBus,
    state: PipelineState,
    stop: StopHandle,
    sink: Option<FrameSink>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, collaborators: Collaborators) -> PipelineResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            collaborators: Some(collaborators),
            bus: XBus::new(),
            state: PipelineState::Idle,
            stop: StopHandle::default(),
            sink: None,
        })
    }

    /// 通过注册表解析配置中的组件
    pub fn from_registry(
        config: PipelineConfig,
        registry: &CapabilityRegistry,
    ) -> PipelineResult<Self> {
        config.validate()?;
        let collaborators = registry.build(&config)?;
        Self::new(config, collaborators)
    }

    /// 生命周期事件总线; 在 `run` 之前订阅
    pub fn bus(&self) -> &XBus {
        &self.bus
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// 显示阶段按帧序交给回调
    pub fn with_frame_sink<F>(mut self, sink: F) -> Self
    where
        F: FnMut(Arc<Frame>) + Send + 'static,
    {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn transition(&mut self, to: PipelineState) -> PipelineResult<()> {
        if !self.state.can_enter(to) {
            return Err(PipelineError::InvalidState {
                from: self.state,
                to,
            });
        }
        info!("🔁 流水线状态: {:?} → {:?}", self.state, to);
        self.state = to;
        Ok(())
    }

    /// 运行直到视频源结束或收到停止信号. 致命错误直接返回, 不做排空.
    pub fn run(&mut self) -> PipelineResult<RunSummary> {
        self.transition(PipelineState::Opening)?;
        let Some(mut parts) = self.collaborators.take() else {
            return Err(PipelineError::InvalidState {
                from: self.state,
                to: PipelineState::Running,
            });
        };

        match self.run_with(&mut parts) {
            Ok(summary) => Ok(summary),
            Err(e) => {
                error!("❌ 流水线中止: {}", e);
                parts.source.stop();
                self.state = PipelineState::Closed;
                Err(e)
            }
        }
    }

    fn run_with(&mut self, parts: &mut Collaborators) -> PipelineResult<RunSummary> {
        let config = self.config.clone();

        // ========== Opening ==========
        parts.source.watch_stop(self.stop.signal());
        let specs = parts
            .source
            .open(&config.source_uri)
            .map_err(|e| PipelineError::SourceOpen {
                uri: config.source_uri.clone(),
                reason: e.to_string(),
            })?;
        info!(
            "📹 视频源已打开: {} ({}x{} @ {:.1}fps)",
            config.source_uri, specs.width, specs.height, specs.frame_rate
        );

        parts
            .detector
            .init(&specs)
            .map_err(|e| PipelineError::init("detector", e))?;
        parts
            .tracker
            .init(&specs)
            .map_err(|e| PipelineError::init("tracker", e))?;
        if let Some(path) = &config.region_definition {
            parts
                .region
                .load_definition(path, specs.width, specs.height)
                .map_err(|e| PipelineError::init("region classifier", e))?;
        }
        for handler in parts.handlers.iter_mut() {
            handler
                .init(&specs)
                .map_err(|e| PipelineError::init(handler.name().to_string(), e))?;
        }

        let consumer = config.debug_display || self.sink.is_some();
        let renderer = if config.debug_display {
            Some(
                DebugRenderer::new(
                    config.debug_output_dir.clone(),
                    config.debug_font_path.as_deref(),
                )
                .map_err(|e| PipelineError::init("debug renderer", e))?,
            )
        } else {
            None
        };

        let raw: BoundedQueue<Frame> = BoundedQueue::try_new(config.raw_queue_capacity)?
            .with_timing(config.dequeue_timeout(), config.dequeue_poll());
        let analyzed: BoundedQueue<Arc<Frame>> =
            BoundedQueue::try_new(config.analyzed_queue_capacity)?
                .with_timing(config.dequeue_timeout(), config.dequeue_poll());
        let window = SlideWindow::try_new(config.window_size, self.bus.clone())?;
        let cache = Arc::new(SnapshotCache::new(
            config.snapshot_config(),
            parts.store.clone(),
        ));

        // 订阅凭证在窗口关闭之后才释放
        let mut subscriptions = cache.attach(&self.bus);
        subscriptions.extend(parts.region.on_attach(&self.bus));
        for handler in parts.handlers.iter_mut() {
            subscriptions.extend(handler.on_attach(&self.bus));
        }

        // ========== Running ==========
        self.transition(PipelineState::Running)?;
        let stats = PipelineStats::default();
        let ingest_done = AtomicBool::new(false);
        let analyze_done = AtomicBool::new(false);
        let stop = self.stop.clone();
        let mut sink = self.sink.take();

        let Collaborators {
            source,
            detector,
            tracker,
            region,
            handlers,
            ..
        } = parts;

        let outcome: PipelineResult<()> = thread::scope(|s| {
            let ingest = thread::Builder::new()
                .name("ingest".into())
                .spawn_scoped(s, || {
                    let _guard = StageGuard {
                        done: &ingest_done,
                        stop: &stop,
                    };
                    Ingest {
                        source: &mut **source,
                        raw: &raw,
                        device_id: &config.device_id,
                        specs: &specs,
                        stride: config.frame_stride,
                        max_frames: config.max_frames,
                        stop: &stop,
                        stats: &stats,
                    }
                    .run();
                })?;

            let analyze = thread::Builder::new()
                .name("analyze".into())
                .spawn_scoped(s, || {
                    let _guard = StageGuard {
                        done: &analyze_done,
                        stop: &stop,
                    };
                    Analyze {
                        raw: &raw,
                        analyzed: consumer.then_some(&analyzed),
                        ingest_done: &ingest_done,
                        detector: &mut **detector,
                        region: &mut **region,
                        tracker: &mut **tracker,
                        handlers: handlers.as_mut_slice(),
                        cache: &cache,
                        window: &window,
                        confidence_threshold: config.confidence_threshold,
                        stats: &stats,
                    }
                    .run();
                })?;

            let display = if consumer {
                Some(
                    thread::Builder::new()
                        .name("display".into())
                        .spawn_scoped(s, || {
                            Display {
                                analyzed: &analyzed,
                                analyze_done: &analyze_done,
                                renderer,
                                sink: sink.as_mut(),
                                stats: &stats,
                            }
                            .run();
                        })?,
                )
            } else {
                None
            };

            let mut failed = None;
            if ingest.join().is_err() {
                failed = Some("ingest");
            }
            // 采集结束, 剩余阶段排空队列
            if failed.is_none() {
                self.transition(PipelineState::Draining)?;
            }
            if analyze.join().is_err() {
                failed = failed.or(Some("analyze"));
            }
            if let Some(display) = display {
                if display.join().is_err() {
                    failed = failed.or(Some("display"));
                }
            }
            match failed {
                Some(stage) => Err(PipelineError::StagePanicked(stage)),
                None => Ok(()),
            }
        });

        // ========== Closed ==========
        let flushed = window.close();
        let leftover = raw.clear() + analyzed.clear();
        if leftover > 0 {
            warn!("⚠️ 关闭时丢弃 {} 个未处理帧", leftover);
        }
        source.stop();
        drop(subscriptions);
        outcome?;

        self.transition(PipelineState::Closed)?;
        let mut summary = RunSummary::from_stats(&stats);
        summary.raw_queue_high_water = raw.max_occupied_ever_observed();
        summary.raw_queue_evicted = raw.evicted_count();
        summary.analyzed_queue_high_water = analyzed.max_occupied_ever_observed();
        summary.analyzed_queue_evicted = analyzed.evicted_count();
        summary.window_evicted = window.evicted_count() + flushed;
        summary.snapshots_saved = cache.saved_count();
        summary.print();
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{SourceSpecs, SyntheticSource};
    use crate::window::FrameExpired;
    use std::sync::Mutex;

    fn synthetic(frames: u64) -> Collaborators {
        Collaborators::new(Box::new(SyntheticSource::new(16, 16, frames, 25.0)))
    }

    #[test]
    fn test_state_transitions() {
        use PipelineState::*;
        assert!(Idle.can_enter(Opening));
        assert!(Opening.can_enter(Closed));
        assert!(!Idle.can_enter(Running));
        assert!(!Closed.can_enter(Opening));
    }

    #[test]
    fn test_run_without_consumer_flushes_window() {
        let config = PipelineConfig {
            window_size: 4,
            ..Default::default()
        };
        let mut pipeline = Pipeline::new(config, synthetic(10)).unwrap();
        let expired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&expired);
        let _sub = pipeline
            .bus()
            .subscribe::<FrameExpired, _>(move |ev| sink.lock().unwrap().push(ev.key.frame_id));

        let summary = pipeline.run().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Closed);
        assert_eq!(summary.frames_analyzed, 10);
        assert_eq!(summary.frames_displayed, 0);
        assert_eq!(summary.window_evicted, 10);
        assert_eq!(*expired.lock().unwrap(), (1..=10).collect::<Vec<u64>>());
    }

    #[test]
    fn test_second_run_is_rejected() {
        let mut pipeline = Pipeline::new(PipelineConfig::default(), synthetic(1)).unwrap();
        pipeline.run().unwrap();
        assert!(matches!(
            pipeline.run(),
            Err(PipelineError::InvalidState { .. })
        ));
    }

    struct Unopenable;

    impl VideoSource for Unopenable {
        fn open(&mut self, uri: &str) -> anyhow::Result<SourceSpecs> {
            anyhow::bail!("cannot reach {}", uri)
        }

        fn decode_next(&mut self) -> anyhow::Result<Option<image::RgbImage>> {
            Ok(None)
        }

        fn stop(&mut self) {}
    }

    #[test]
    fn test_source_open_failure_is_fatal() {
        let mut pipeline =
            Pipeline::new(PipelineConfig::default(), Collaborators::new(Box::new(Unopenable)))
                .unwrap();
        assert!(matches!(
            pipeline.run(),
            Err(PipelineError::SourceOpen { .. })
        ));
        assert_eq!(pipeline.state(), PipelineState::Closed);
    }

    struct BrokenTracker;

    impl ObjectTracker for BrokenTracker {
        fn init(&mut self, _specs: &SourceSpecs) -> anyhow::Result<()> {
            anyhow::bail!("no license")
        }

        fn track(
            &mut self,
            _image: &image::RgbImage,
            _objects: &mut [crate::detection::DetectedObject],
        ) -> anyhow::Result<()> {
            Ok(())
        }

        fn reset(&mut self) {}

        fn track_count(&self) -> usize {
            0
        }
    }

    #[test]
    fn test_tracker_init_failure_is_fatal() {
        let mut pipeline = Pipeline::new(
            PipelineConfig::default(),
            synthetic(5).with_tracker(Box::new(BrokenTracker)),
        )
        .unwrap();
        match pipeline.run() {
            Err(PipelineError::CollaboratorInit { component, .. }) => {
                assert_eq!(component, "tracker")
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_stop_handle_stops_live_source() {
        let source = SyntheticSource::from_config(crate::input::SyntheticConfig {
            frame_count: None,
            realtime: true,
            fps: 200.0,
            ..Default::default()
        });
        let mut pipeline =
            Pipeline::new(PipelineConfig::default(), Collaborators::new(Box::new(source))).unwrap();
        let stop = pipeline.stop_handle();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(100));
            stop.stop();
        });
        let summary = pipeline.run().unwrap();
        stopper.join().unwrap();
        assert!(summary.frames_ingested > 0);
        assert_eq!(summary.frames_analyzed, summary.frames_ingested);
    }

    /// 打开成功后不再产出帧, 发送端一直存活 (模拟卡住的直播流)
    struct Stalled {
        rx: crossbeam_channel::Receiver<image::RgbImage>,
        _tx: crossbeam_channel::Sender<image::RgbImage>,
        stop: Arc<AtomicBool>,
    }

    impl Stalled {
        fn new() -> Self {
            let (tx, rx) = crossbeam_channel::bounded(1);
            Self {
                rx,
                _tx: tx,
                stop: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl VideoSource for Stalled {
        fn open(&mut self, _uri: &str) -> anyhow::Result<SourceSpecs> {
            Ok(SourceSpecs {
                width: 8,
                height: 8,
                frame_rate: 25.0,
                frame_count: None,
            })
        }

        fn decode_next(&mut self) -> anyhow::Result<Option<image::RgbImage>> {
            Ok(crate::input::recv_until_stopped(
                &self.rx,
                &self.stop,
                std::time::Duration::from_millis(10),
            ))
        }

        fn stop(&mut self) {}

        fn watch_stop(&mut self, signal: Arc<AtomicBool>) {
            self.stop = signal;
        }
    }

    #[test]
    fn test_stop_handle_interrupts_stalled_source() {
        let mut pipeline =
            Pipeline::new(PipelineConfig::default(), Collaborators::new(Box::new(Stalled::new())))
                .unwrap();
        let stop = pipeline.stop_handle();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(100));
            stop.stop();
        });
        let started = std::time::Instant::now();
        let summary = pipeline.run().unwrap();
        stopper.join().unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert_eq!(summary.frames_ingested, 0);
        assert_eq!(pipeline.state(), PipelineState::Closed);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = PipelineConfig {
            window_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            Pipeline::new(config, synthetic(1)),
            Err(PipelineError::Config(_))
        ));
    }
}
