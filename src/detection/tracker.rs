//! 多目标跟踪
//! Multi-object tracking: assigns and propagates tracking ids in place.

use image::RgbImage;
use serde::{Deserialize, Serialize};

use super::types::{BBox, DetectedObject};
use crate::input::SourceSpecs;

// ========== 跟踪器统一接口 ==========

/// 多目标跟踪器 Trait
///
/// 原地修改检测列表, 为每个目标写入 `tracking_id`.
/// 只在分析线程上调用.
pub trait ObjectTracker: Send {
    /// 初始化 (打开视频源之后调用); 失败属于致命错误
    fn init(&mut self, _specs: &SourceSpecs) -> anyhow::Result<()> {
        Ok(())
    }

    fn track(&mut self, image: &RgbImage, objects: &mut [DetectedObject]) -> anyhow::Result<()>;

    /// 重置跟踪器 (清除所有跟踪)
    fn reset(&mut self);

    /// 获取当前跟踪数量
    fn track_count(&self) -> usize;
}

// ========== IOU 跟踪器 ==========

/// IOU跟踪器参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IouTrackerConfig {
    /// 匹配所需的最小IOU
    pub iou_threshold: f32,
    /// 最大丢失帧数, 超过后删除轨迹
    pub max_lost_frames: u32,
}

impl Default for IouTrackerConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.3,
            max_lost_frames: 30,
        }
    }
}

#[derive(Clone, Debug)]
struct Track {
    id: u32,
    label: String,
    bbox: BBox,
    frames_lost: u32,
}

/// 贪心IOU匹配: 按置信度从高到低, 每个检测框匹配同类别中IOU最大的未匹配轨迹
pub struct IouTracker {
    config: IouTrackerConfig,
    tracks: Vec<Track>,
    next_id: u32,
}

impl IouTracker {
    pub fn new(config: IouTrackerConfig) -> Self {
        Self {
            config,
            tracks: Vec::new(),
            next_id: 1,
        }
    }
}

impl Default for IouTracker {
    fn default() -> Self {
        Self::new(IouTrackerConfig::default())
    }
}

impl ObjectTracker for IouTracker {
    fn track(&mut self, _image: &RgbImage, objects: &mut [DetectedObject]) -> anyhow::Result<()> {
        let mut order: Vec<usize> = (0..objects.len()).collect();
        order.sort_by(|&a, &b| {
            objects[b]
                .bbox
                .confidence
                .total_cmp(&objects[a].bbox.confidence)
        });

        let mut matched = vec![false; self.tracks.len()];
        for idx in order {
            let obj = &mut objects[idx];
            let best = self
                .tracks
                .iter()
                .enumerate()
                .filter(|(t, track)| !matched[*t] && track.label == obj.label)
                .map(|(t, track)| (t, compute_iou(&track.bbox, &obj.bbox)))
                .filter(|(_, iou)| *iou >= self.config.iou_threshold)
                .max_by(|a, b| a.1.total_cmp(&b.1));

            match best {
                Some((t, _)) => {
                    matched[t] = true;
                    let track = &mut self.tracks[t];
                    track.bbox = obj.bbox.clone();
                    track.frames_lost = 0;
                    obj.tracking_id = track.id;
                }
                None => {
                    let id = self.next_id;
                    self.next_id = self.next_id.wrapping_add(1).max(1);
                    obj.tracking_id = id;
                    self.tracks.push(Track {
                        id,
                        label: obj.label.clone(),
                        bbox: obj.bbox.clone(),
                        frames_lost: 0,
                    });
                    matched.push(true);
                }
            }
        }

        // 未匹配的轨迹计入丢失帧
        let max_lost = self.config.max_lost_frames;
        for (track, hit) in self.tracks.iter_mut().zip(matched.iter()) {
            if !hit {
                track.frames_lost += 1;
            }
        }
        self.tracks.retain(|t| t.frames_lost <= max_lost);
        Ok(())
    }

    fn reset(&mut self) {
        self.tracks.clear();
    }

    fn track_count(&self) -> usize {
        self.tracks.len()
    }
}

// ========== 工具函数 ==========

/// 计算两个边界框的IOU (Intersection over Union)
pub fn compute_iou(bbox1: &BBox, bbox2: &BBox) -> f32 {
    let x1 = bbox1.x1.max(bbox2.x1);
    let y1 = bbox1.y1.max(bbox2.y1);
    let x2 = bbox1.x2.min(bbox2.x2);
    let y2 = bbox1.y2.min(bbox2.y2);

    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }

    let intersection = (x2 - x1) * (y2 - y1);
    let union = bbox1.area() + bbox2.area() - intersection;

    if union <= 0.0 {
        return 0.0;
    }

    intersection / union
}

/// 根据ID生成不同颜色
pub fn id_to_color(id: u32) -> (u8, u8, u8) {
    let hue = (id as f32 * 137.508) % 360.0; // 黄金角度采样
    hsv_to_rgb(hue, 0.8, 0.9)
}

/// HSV转RGB
fn hsv_to_rgb(h: f32, s: f32, v: f32) -> (u8, u8, u8) {
    let c = v * s;
    let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
    let m = v - c;

    let (r, g, b) = if h < 60.0 {
        (c, x, 0.0)
    } else if h < 120.0 {
        (x, c, 0.0)
    } else if h < 180.0 {
        (0.0, c, x)
    } else if h < 240.0 {
        (0.0, x, c)
    } else if h < 300.0 {
        (x, 0.0, c)
    } else {
        (c, 0.0, x)
    };

    (
        ((r + m) * 255.0) as u8,
        ((g + m) * 255.0) as u8,
        ((b + m) * 255.0) as u8,
    )
}
