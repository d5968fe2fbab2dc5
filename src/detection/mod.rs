/// 检测系统 (Detection System)
///
/// 分析线程上的同步处理链
/// - Detector: 目标检测
/// - Region:   区域分类 (车道/分析区)
/// - Tracker:  目标追踪
pub mod detector;
pub mod region;
pub mod tracker;
pub mod types;

pub use detector::{NullDetector, ObjectDetector, RecordedDetection, ReplayConfig, ReplayDetector};
pub use region::{PolygonRegions, RegionClassifier, RegionDefinition, WholeFrame};
pub use tracker::{compute_iou, id_to_color, IouTracker, IouTrackerConfig, ObjectTracker};
pub use types::{object_id, BBox, DetectedObject, Frame, FrameKey};
