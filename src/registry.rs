//! 组件注册表 (Capability Registry)
//!
//! 配置中的字符串键 → 工厂函数. 启动时一次性解析, 未知键属于致命的配置错误.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use crate::config::PipelineConfig;
use crate::detection::{
    IouTracker, NullDetector, ObjectDetector, ObjectTracker, PolygonRegions, RegionClassifier,
    ReplayDetector, WholeFrame,
};
use crate::error::{PipelineError, PipelineResult};
use crate::handlers::{AnalysisHandler, DwellTimeHandler, LaneCountHandler};
use crate::input::{ImageDirSource, SyntheticSource, VideoSource};
use crate::pipeline::Collaborators;
use crate::snapshot::{ArtifactStore, DirectoryStore};

type Factory<T> = Box<dyn Fn(&PipelineConfig) -> anyhow::Result<Box<T>> + Send + Sync>;

struct Factories<T: ?Sized> {
    kind: &'static str,
    entries: BTreeMap<String, Factory<T>>,
}

impl<T: ?Sized> Factories<T> {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: BTreeMap::new(),
        }
    }

    fn insert(&mut self, key: String, factory: Factory<T>) {
        self.entries.insert(key, factory);
    }

    fn build(&self, key: &str, config: &PipelineConfig) -> PipelineResult<Box<T>> {
        let factory = self
            .entries
            .get(key)
            .ok_or_else(|| PipelineError::UnknownCapability {
                kind: self.kind,
                key: key.to_string(),
            })?;
        factory(config).map_err(|e| PipelineError::init(format!("{} {:?}", self.kind, key), e))
    }

    fn keys(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }
}

pub struct CapabilityRegistry {
    sources: Factories<dyn VideoSource>,
    detectors: Factories<dyn ObjectDetector>,
    trackers: Factories<dyn ObjectTracker>,
    regions: Factories<dyn RegionClassifier>,
    handlers: Factories<dyn AnalysisHandler>,
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl CapabilityRegistry {
    /// 空注册表
    pub fn new() -> Self {
        Self {
            sources: Factories::new("source"),
            detectors: Factories::new("detector"),
            trackers: Factories::new("tracker"),
            regions: Factories::new("region classifier"),
            handlers: Factories::new("handler"),
        }
    }

    /// 内置组件
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        registry.register_source("synthetic", |config| {
            Ok(Box::new(SyntheticSource::from_config(
                config.collaborator("synthetic")?,
            )))
        });
        registry.register_source("image_dir", |config| {
            Ok(Box::new(ImageDirSource::new(config.collaborator("image_dir")?)))
        });
        #[cfg(feature = "ffmpeg")]
        registry.register_source("ffmpeg", |config| {
            Ok(Box::new(crate::input::FfmpegSource::new(
                config.collaborator("ffmpeg")?,
            )))
        });

        registry.register_detector("null", |_| Ok(Box::new(NullDetector)));
        registry.register_detector("replay", |config| {
            Ok(Box::new(ReplayDetector::from_config(
                &config.collaborator("replay")?,
            )?))
        });

        registry.register_tracker("iou", |config| {
            Ok(Box::new(IouTracker::new(config.collaborator("iou")?)))
        });

        registry.register_region("all", |_| Ok(Box::new(WholeFrame)));
        registry.register_region("whole", |_| Ok(Box::new(WholeFrame)));
        registry.register_region("polygon", |_| Ok(Box::new(PolygonRegions::new())));

        registry.register_handler("dwell_time", |_| Ok(Box::new(DwellTimeHandler::new())));
        registry.register_handler("lane_count", |_| Ok(Box::new(LaneCountHandler::new())));

        registry
    }

    pub fn register_source<F>(&mut self, key: impl Into<String>, factory: F)
    where
        F: Fn(&PipelineConfig) -> anyhow::Result<Box<dyn VideoSource>> + Send + Sync + 'static,
    {
        self.sources.insert(key.into(), Box::new(factory));
    }

    pub fn register_detector<F>(&mut self, key: impl Into<String>, factory: F)
    where
        F: Fn(&PipelineConfig) -> anyhow::Result<Box<dyn ObjectDetector>> + Send + Sync + 'static,
    {
        self.detectors.insert(key.into(), Box::new(factory));
    }

    pub fn register_tracker<F>(&mut self, key: impl Into<String>, factory: F)
    where
        F: Fn(&PipelineConfig) -> anyhow::Result<Box<dyn ObjectTracker>> + Send + Sync + 'static,
    {
        self.trackers.insert(key.into(), Box::new(factory));
    }

    pub fn register_region<F>(&mut self, key: impl Into<String>, factory: F)
    where
        F: Fn(&PipelineConfig) -> anyhow::Result<Box<dyn RegionClassifier>>
            + Send
            + Sync
            + 'static,
    {
        self.regions.insert(key.into(), Box::new(factory));
    }

    pub fn register_handler<F>(&mut self, key: impl Into<String>, factory: F)
    where
        F: Fn(&PipelineConfig) -> anyhow::Result<Box<dyn AnalysisHandler>> + Send + Sync + 'static,
    {
        self.handlers.insert(key.into(), Box::new(factory));
    }

    pub fn source_keys(&self) -> Vec<&str> {
        self.sources.keys()
    }

    pub fn handler_keys(&self) -> Vec<&str> {
        self.handlers.keys()
    }

    /// 按配置解析全部组件
    pub fn build(&self, config: &PipelineConfig) -> PipelineResult<Collaborators> {
        let source = self.sources.build(&config.source, config)?;
        let detector = self.detectors.build(&config.detector, config)?;
        let tracker = self.trackers.build(&config.tracker, config)?;
        let region = self.regions.build(&config.region_classifier, config)?;
        let handlers = config
            .handlers
            .iter()
            .map(|key| self.handlers.build(key, config))
            .collect::<PipelineResult<Vec<_>>>()?;

        let store: Option<Arc<dyn ArtifactStore>> = if config.save_best_snapshot {
            Some(Arc::new(DirectoryStore::new(&config.artifact_dir)))
        } else {
            None
        };

        info!(
            "🧩 组件: source={} detector={} tracker={} region={} handlers={:?}",
            config.source, config.detector, config.tracker, config.region_classifier, config.handlers
        );
        Ok(Collaborators {
            source,
            detector,
            tracker,
            region,
            handlers,
            store,
        })
    }
}
