//! 视频分析数据结构定义
//! Data model shared by every pipeline stage.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};

// ========== 检测框 ==========

/// 检测框 (Detection bounding box), 像素坐标
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub class_id: u32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32, class_id: u32) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            confidence,
            class_id,
        }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// 底边中点 (目标的"落脚点", 用于区域判断)
    pub fn bottom_center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, self.y2)
    }

    /// 裁剪到图像范围内, 返回 (x, y, w, h); 无交集时返回 None
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let x1 = self.x1.max(0.0).min(width as f32) as u32;
        let y1 = self.y1.max(0.0).min(height as f32) as u32;
        let x2 = self.x2.max(0.0).min(width as f32) as u32;
        let y2 = self.y2.max(0.0).min(height as f32) as u32;
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some((x1, y1, x2 - x1, y2 - y1))
    }
}

// ========== 检测目标 ==========

/// 检测目标. 跟踪器分配 `tracking_id` 之前为0.
#[derive(Clone, Debug)]
pub struct DetectedObject {
    pub bbox: BBox,
    pub label: String,
    pub tracking_id: u32,
    /// 是否处于分析区域内 (由区域分类器设置)
    pub under_analysis: bool,
    /// 车道/分组序号
    pub lane_index: Option<usize>,
    /// 目标截图
    pub snapshot: Option<Arc<RgbImage>>,
}

impl DetectedObject {
    pub fn new(label: impl Into<String>, bbox: BBox) -> Self {
        Self {
            bbox,
            label: label.into(),
            tracking_id: 0,
            under_analysis: false,
            lane_index: None,
            snapshot: None,
        }
    }

    pub fn with_tracking_id(mut self, tracking_id: u32) -> Self {
        self.tracking_id = tracking_id;
        self
    }

    pub fn label_id(&self) -> u32 {
        self.bbox.class_id
    }

    /// 目标身份 `"{label}:{trackingId}"`.
    /// 跟踪ID在长时间消失后可能被复用, 身份只在同一设备的当前窗口内唯一.
    pub fn id(&self) -> String {
        object_id(&self.label, self.tracking_id)
    }
}

pub fn object_id(label: &str, tracking_id: u32) -> String {
    format!("{}:{}", label, tracking_id)
}

// ========== 帧 ==========

/// 帧身份: (设备ID, 帧序号). 按帧序号排序.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameKey {
    pub frame_id: u64,
    pub device_id: String,
}

impl FrameKey {
    pub fn new(device_id: impl Into<String>, frame_id: u64) -> Self {
        Self {
            frame_id,
            device_id: device_id.into(),
        }
    }
}

impl std::fmt::Display for FrameKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.device_id, self.frame_id)
    }
}

/// 视频帧 (采集 → 分析 → 窗口/显示)
///
/// 分析阶段独占并原地修改; 进入滑动窗口后以 `Arc<Frame>` 共享, 不再修改.
/// 图像缓冲区在最后一个持有者释放时回收, 恰好一次.
pub struct Frame {
    pub device_id: String,
    /// 每个设备严格递增
    pub frame_id: u64,
    /// 相对视频起点的偏移 (毫秒)
    pub offset_ms: u64,
    pub timestamp: DateTime<Utc>,
    image: Arc<RgbImage>,
    pub objects: Vec<DetectedObject>,
    properties: HashMap<String, serde_json::Value>,
}

impl Frame {
    pub fn new(device_id: impl Into<String>, frame_id: u64, offset_ms: u64, image: RgbImage) -> Self {
        Self {
            device_id: device_id.into(),
            frame_id,
            offset_ms,
            timestamp: Utc::now(),
            image: Arc::new(image),
            objects: Vec::new(),
            properties: HashMap::new(),
        }
    }

    pub fn key(&self) -> FrameKey {
        FrameKey::new(self.device_id.clone(), self.frame_id)
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// 共享图像句柄 (场景缓存使用, 零拷贝)
    pub fn shared_image(&self) -> Arc<RgbImage> {
        Arc::clone(&self.image)
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn with_objects(mut self, objects: Vec<DetectedObject>) -> Self {
        self.objects = objects;
        self
    }

    pub fn object_ids(&self) -> Vec<String> {
        self.objects.iter().map(DetectedObject::id).collect()
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.properties.insert(key.into(), value);
    }

    pub fn property(&self, key: &str) -> Option<&serde_json::Value> {
        self.properties.get(key)
    }

    pub fn properties(&self) -> &HashMap<String, serde_json::Value> {
        &self.properties
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("device_id", &self.device_id)
            .field("frame_id", &self.frame_id)
            .field("offset_ms", &self.offset_ms)
            .field(
                "image",
                &format_args!("{}x{}", self.image.width(), self.image.height()),
            )
            .field("objects", &self.object_ids())
            .field("properties", &self.properties.keys().collect::<Vec<_>>())
            .finish()
    }
}
