//! 检测器 (Detector)
//! 职责: 图像 → 检测框列表 (label, label_id, confidence)
//!
//! 具体的检测模型不属于本crate; 这里只定义接口和两个参考实现:
//! - [`NullDetector`]: 永远没有检测结果
//! - [`ReplayDetector`]: 按调用顺序回放预先录制的检测结果 (JSON)

use std::fs;
use std::path::Path;

use image::RgbImage;
use serde::{Deserialize, Serialize};

use super::types::{BBox, DetectedObject};
use crate::input::SourceSpecs;

/// 目标检测器 Trait
pub trait ObjectDetector: Send {
    /// 初始化 (加载模型等); 失败属于致命错误
    fn init(&mut self, _specs: &SourceSpecs) -> anyhow::Result<()> {
        Ok(())
    }

    /// 单帧检测. 单次失败由调用方按"无检测结果"处理.
    fn detect(
        &mut self,
        image: &RgbImage,
        confidence_threshold: f32,
    ) -> anyhow::Result<Vec<DetectedObject>>;
}

/// 空检测器
#[derive(Debug, Default)]
pub struct NullDetector;

impl ObjectDetector for NullDetector {
    fn detect(&mut self, _image: &RgbImage, _threshold: f32) -> anyhow::Result<Vec<DetectedObject>> {
        Ok(Vec::new())
    }
}

/// 录制的单个检测结果
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordedDetection {
    pub label: String,
    pub label_id: u32,
    pub confidence: f32,
    /// [x1, y1, x2, y2]
    pub bbox: [f32; 4],
}

impl RecordedDetection {
    pub fn new(label: &str, label_id: u32, confidence: f32, bbox: [f32; 4]) -> Self {
        Self {
            label: label.to_string(),
            label_id,
            confidence,
            bbox,
        }
    }

    fn to_object(&self) -> DetectedObject {
        let [x1, y1, x2, y2] = self.bbox;
        DetectedObject::new(
            self.label.clone(),
            BBox::new(x1, y1, x2, y2, self.confidence, self.label_id),
        )
    }
}

/// 回放检测器参数
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// 录制文件路径: `[[RecordedDetection, ...], ...]`, 第N个元素对应第N次调用
    pub path: Option<String>,
    /// 回放结束后从头循环
    pub looped: bool,
}

/// 回放检测器: 第N次调用返回脚本中第N帧的检测结果
pub struct ReplayDetector {
    script: Vec<Vec<RecordedDetection>>,
    cursor: usize,
    looped: bool,
}

impl ReplayDetector {
    pub fn new(script: Vec<Vec<RecordedDetection>>) -> Self {
        Self {
            script,
            cursor: 0,
            looped: false,
        }
    }

    pub fn looped(mut self, looped: bool) -> Self {
        self.looped = looped;
        self
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let json = fs::read_to_string(path.as_ref())?;
        let script: Vec<Vec<RecordedDetection>> = serde_json::from_str(&json)?;
        Ok(Self::new(script))
    }

    pub fn from_config(config: &ReplayConfig) -> anyhow::Result<Self> {
        let path = config
            .path
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("replay detector requires a `path`"))?;
        Ok(Self::from_json_file(path)?.looped(config.looped))
    }
}

impl ObjectDetector for ReplayDetector {
    fn detect(&mut self, _image: &RgbImage, threshold: f32) -> anyhow::Result<Vec<DetectedObject>> {
        if self.looped && !self.script.is_empty() {
            self.cursor %= self.script.len();
        }
        let objects = self
            .script
            .get(self.cursor)
            .map(|dets| {
                dets.iter()
                    .filter(|d| d.confidence >= threshold)
                    .map(RecordedDetection::to_object)
                    .collect()
            })
            .unwrap_or_default();
        self.cursor += 1;
        Ok(objects)
    }
}
