//! 流水线配置 - JSON文件 + 命令行覆盖

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{PipelineError, PipelineResult};
use crate::snapshot::SnapshotConfig;

/// 流水线参数配置
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    // === 视频源 ===
    pub device_id: String,
    pub source_uri: String,
    pub source: String, // 注册表键: synthetic / image_dir / ffmpeg

    // === 处理链 ===
    pub detector: String,
    pub tracker: String,
    pub region_classifier: String,
    pub handlers: Vec<String>,
    pub confidence_threshold: f32,
    pub region_definition: Option<PathBuf>,

    // === 窗口与队列 ===
    pub window_size: usize,
    pub raw_queue_capacity: usize,
    pub analyzed_queue_capacity: usize,
    pub frame_stride: u64,      // 每N帧采样一帧
    pub max_frames: Option<u64>, // 采样帧数上限
    pub dequeue_timeout_ms: u64,
    pub dequeue_poll_ms: u64,

    // === 快照 ===
    pub snapshot_retention: usize,
    pub save_best_snapshot: bool,
    pub best_snapshot_min_size: u32,
    pub artifact_dir: PathBuf,

    // === 调试显示 ===
    pub debug_display: bool,
    pub debug_output_dir: Option<PathBuf>,
    pub debug_font_path: Option<PathBuf>,

    /// 各组件的私有参数, 按注册表键索引
    pub collaborators: serde_json::Value,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            device_id: "camera-0".into(),
            source_uri: "synthetic://default".into(),
            source: "synthetic".into(),

            detector: "null".into(),
            tracker: "iou".into(),
            region_classifier: "all".into(),
            handlers: Vec::new(),
            confidence_threshold: 0.25,
            region_definition: None,

            window_size: 30,
            raw_queue_capacity: 50,
            analyzed_queue_capacity: 50,
            frame_stride: 1,
            max_frames: None,
            dequeue_timeout_ms: 500,
            dequeue_poll_ms: 30,

            snapshot_retention: 5,
            save_best_snapshot: false,
            best_snapshot_min_size: 32,
            artifact_dir: PathBuf::from("snapshots"),

            debug_display: false,
            debug_output_dir: None,
            debug_font_path: None,

            collaborators: serde_json::Value::Object(Default::default()),
        }
    }
}

impl PipelineConfig {
    /// 从JSON文件加载配置; 文件不存在时创建默认配置
    pub fn load(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(json) => {
                let config: Self = serde_json::from_str(&json)?;
                info!("✅ 配置已从 {} 加载", path.display());
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("📝 配置文件不存在, 创建默认配置...");
                let config = Self::default();
                config.save(path)?;
                Ok(config)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: impl AsRef<Path>) -> PipelineResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        info!("💾 配置已保存到 {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> PipelineResult<()> {
        let positive = [
            ("window_size", self.window_size as u64),
            ("raw_queue_capacity", self.raw_queue_capacity as u64),
            ("analyzed_queue_capacity", self.analyzed_queue_capacity as u64),
            ("snapshot_retention", self.snapshot_retention as u64),
            ("frame_stride", self.frame_stride),
            ("dequeue_timeout_ms", self.dequeue_timeout_ms),
            ("dequeue_poll_ms", self.dequeue_poll_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(PipelineError::Config(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(PipelineError::Config(format!(
                "confidence_threshold {} out of [0, 1]",
                self.confidence_threshold
            )));
        }
        if self.device_id.is_empty() || self.source.is_empty() {
            return Err(PipelineError::Config(
                "device_id and source must not be empty".into(),
            ));
        }
        if !self.collaborators.is_object() {
            return Err(PipelineError::Config(
                "collaborators must be a JSON object".into(),
            ));
        }
        Ok(())
    }

    /// 读取某个组件的私有参数; 未配置时返回默认值
    pub fn collaborator<T>(&self, key: &str) -> PipelineResult<T>
    where
        T: DeserializeOwned + Default,
    {
        match self.collaborators.get(key) {
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                PipelineError::Config(format!("collaborators.{}: {}", key, e))
            }),
            None => Ok(T::default()),
        }
    }

    pub fn snapshot_config(&self) -> SnapshotConfig {
        SnapshotConfig {
            retention: self.snapshot_retention,
            save_best: self.save_best_snapshot,
            min_size: self.best_snapshot_min_size,
        }
    }

    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms)
    }

    pub fn dequeue_poll(&self) -> Duration {
        Duration::from_millis(self.dequeue_poll_ms)
    }

    /// 打印当前配置
    pub fn print_summary(&self) {
        info!("🎛️  当前流水线配置:");
        info!("  设备: {} | 视频源: {} ({})", self.device_id, self.source_uri, self.source);
        info!(
            "  检测器: {} | 跟踪器: {} | 区域: {}",
            self.detector, self.tracker, self.region_classifier
        );
        info!("  处理器: {:?}", self.handlers);
        info!(
            "  窗口: {} 帧 | 队列: {}/{} | 采样间隔: {}",
            self.window_size, self.raw_queue_capacity, self.analyzed_queue_capacity, self.frame_stride
        );
        info!(
            "  截图保留: {} | 保存最佳: {} (≥{}px) → {}",
            self.snapshot_retention,
            self.save_best_snapshot,
            self.best_snapshot_min_size,
            self.artifact_dir.display()
        );
        info!("  调试显示: {}", self.debug_display);
    }
}

/// 数字卫兵参数
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "数字卫兵 - 视频分析流水线", long_about = None)]
pub struct Args {
    /// 配置文件 (不存在时自动创建)
    #[arg(short, long, default_value = "sentinel.json")]
    pub config: PathBuf,

    /// 视频源地址 (覆盖配置文件)
    #[arg(short = 'u', long)]
    pub source_uri: Option<String>,

    /// 视频源类型: synthetic / image_dir / ffmpeg
    #[arg(short, long)]
    pub source: Option<String>,

    /// 滑动窗口帧数
    #[arg(short, long)]
    pub window_size: Option<usize>,

    /// 每N帧采样一帧
    #[arg(long)]
    pub stride: Option<u64>,

    /// 采样帧数上限
    #[arg(short, long)]
    pub max_frames: Option<u64>,

    /// 启用调试显示
    #[arg(short, long)]
    pub debug_display: bool,

    /// 调试帧输出目录
    #[arg(long)]
    pub debug_output: Option<PathBuf>,

    /// 目标过期时保存最佳截图
    #[arg(long)]
    pub save_best: bool,
}

impl Args {
    /// 命令行参数覆盖配置文件
    pub fn apply(&self, config: &mut PipelineConfig) {
        if let Some(uri) = &self.source_uri {
            config.source_uri = uri.clone();
        }
        if let Some(source) = &self.source {
            config.source = source.clone();
        }
        if let Some(size) = self.window_size {
            config.window_size = size;
        }
        if let Some(stride) = self.stride {
            config.frame_stride = stride;
        }
        if self.max_frames.is_some() {
            config.max_frames = self.max_frames;
        }
        if self.debug_display {
            config.debug_display = true;
        }
        if let Some(dir) = &self.debug_output {
            config.debug_output_dir = Some(dir.clone());
        }
        if self.save_best {
            config.save_best_snapshot = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::IouTrackerConfig;

    #[test]
    fn test_missing_file_creates_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("sentinel.json");
        let config = PipelineConfig::load(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.window_size, 30);
        assert_eq!(config.raw_queue_capacity, 50);
        assert_eq!(config.dequeue_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentinel.json");
        fs::write(&path, r#"{"window_size": 3, "handlers": ["dwell_time"]}"#).unwrap();
        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.window_size, 3);
        assert_eq!(config.handlers, vec!["dwell_time"]);
        assert_eq!(config.snapshot_retention, 5);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentinel.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            PipelineConfig::load(&path),
            Err(PipelineError::Json(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = PipelineConfig {
            raw_queue_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_collaborator_settings() {
        let config = PipelineConfig {
            collaborators: serde_json::json!({"iou": {"max_lost_frames": 5}}),
            ..Default::default()
        };
        let iou: IouTrackerConfig = config.collaborator("iou").unwrap();
        assert_eq!(iou.max_lost_frames, 5);
        assert_eq!(iou.iou_threshold, 0.3);

        let missing: IouTrackerConfig = config.collaborator("other").unwrap();
        assert_eq!(missing.max_lost_frames, 30);
    }

    #[test]
    fn test_args_override_file() {
        let args = Args::parse_from(["sentinel", "--window-size", "7", "--stride", "2", "-d"]);
        let mut config = PipelineConfig::default();
        args.apply(&mut config);
        assert_eq!(config.window_size, 7);
        assert_eq!(config.frame_stride, 2);
        assert!(config.debug_display);
        assert!(!config.save_best_snapshot);
    }
}
