//! 区域分类 (Region Classification)
//!
//! 判断目标是否处于分析区域, 并写入车道/分组序号.
//! 分类器可以订阅目标过期消息, 释放按目标ID保存的内部状态.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::types::DetectedObject;
use crate::window::ObjectExpired;
use crate::xbus::{Subscription, XBus};

pub trait RegionClassifier: Send {
    /// 加载区域定义文件, 坐标按图像尺寸换算
    fn load_definition(&mut self, path: &Path, image_width: u32, image_height: u32)
        -> anyhow::Result<()>;

    /// 设置 `under_analysis` 和 `lane_index`. 在跟踪之前调用, 跟踪ID尚未分配.
    fn classify(&mut self, objects: &mut [DetectedObject]);

    /// 跟踪完成后调用, 此时目标已带有跟踪ID (可选)
    fn observe_tracked(&mut self, _objects: &[DetectedObject]) {}

    /// 订阅生命周期消息 (可选)
    fn on_attach(&mut self, _bus: &XBus) -> Vec<Subscription> {
        Vec::new()
    }
}

/// 不做区域划分: 所有目标都参与分析, 车道为0
#[derive(Debug, Default)]
pub struct WholeFrame;

impl RegionClassifier for WholeFrame {
    fn load_definition(&mut self, _path: &Path, _w: u32, _h: u32) -> anyhow::Result<()> {
        Ok(())
    }

    fn classify(&mut self, objects: &mut [DetectedObject]) {
        for obj in objects {
            obj.under_analysis = true;
            obj.lane_index = Some(0);
        }
    }
}

// ========== 多边形区域 ==========

/// 区域定义文件格式
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionDefinition {
    /// 坐标是否为 0~1 归一化值
    pub normalized: bool,
    pub lanes: Vec<LaneDefinition>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LaneDefinition {
    pub name: String,
    pub points: Vec<[f32; 2]>,
}

#[derive(Clone, Debug)]
struct Lane {
    name: String,
    polygon: Vec<(f32, f32)>,
}

/// 多边形车道区域: 目标底边中点落在哪个多边形内就属于哪条车道
pub struct PolygonRegions {
    lanes: Vec<Lane>,
    /// 目标首次进入分析区域时所在的车道
    entry_lanes: Arc<Mutex<HashMap<String, usize>>>,
}

impl PolygonRegions {
    pub fn new() -> Self {
        Self {
            lanes: Vec::new(),
            entry_lanes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn from_definition(def: &RegionDefinition, image_width: u32, image_height: u32) -> Self {
        let mut regions = Self::new();
        regions.apply(def, image_width, image_height);
        regions
    }

    fn apply(&mut self, def: &RegionDefinition, image_width: u32, image_height: u32) {
        let (sx, sy) = if def.normalized {
            (image_width as f32, image_height as f32)
        } else {
            (1.0, 1.0)
        };
        self.lanes = def
            .lanes
            .iter()
            .map(|lane| Lane {
                name: lane.name.clone(),
                polygon: lane.points.iter().map(|[x, y]| (x * sx, y * sy)).collect(),
            })
            .collect();
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    pub fn lane_name(&self, index: usize) -> Option<&str> {
        self.lanes.get(index).map(|l| l.name.as_str())
    }

    /// 目标首次进入的车道
    pub fn entry_lane(&self, object_id: &str) -> Option<usize> {
        self.entry_lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(object_id)
            .copied()
    }

    pub fn tracked_entries(&self) -> usize {
        self.entry_lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for PolygonRegions {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionClassifier for PolygonRegions {
    fn load_definition(
        &mut self,
        path: &Path,
        image_width: u32,
        image_height: u32,
    ) -> anyhow::Result<()> {
        let json = fs::read_to_string(path)?;
        let def: RegionDefinition = serde_json::from_str(&json)?;
        self.apply(&def, image_width, image_height);
        info!(
            "🗺️  区域定义已加载: {} 条车道 ({})",
            self.lanes.len(),
            path.display()
        );
        Ok(())
    }

    fn classify(&mut self, objects: &mut [DetectedObject]) {
        for obj in objects {
            let (px, py) = obj.bbox.bottom_center();
            let lane = self
                .lanes
                .iter()
                .position(|lane| point_in_polygon(px, py, &lane.polygon));
            obj.under_analysis = lane.is_some();
            obj.lane_index = lane;
        }
    }

    fn observe_tracked(&mut self, objects: &[DetectedObject]) {
        let mut entries = self
            .entry_lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for obj in objects {
            // 未跟踪的检测框没有稳定身份
            if let (Some(lane), true) = (obj.lane_index, obj.tracking_id != 0) {
                entries.entry(obj.id()).or_insert(lane);
            }
        }
    }

    fn on_attach(&mut self, bus: &XBus) -> Vec<Subscription> {
        let entries = Arc::clone(&self.entry_lanes);
        let sub = bus.subscribe::<ObjectExpired, _>(move |ev| {
            let removed = entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&ev.object_id);
            if removed.is_some() {
                debug!(object = %ev.object_id, "释放车道状态");
            }
        });
        vec![sub]
    }
}

/// 射线法判断点是否在多边形内
pub fn point_in_polygon(x: f32, y: f32, polygon: &[(f32, f32)]) -> bool {
    if polygon.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let (xi, yi) = polygon[i];
        let (xj, yj) = polygon[j];
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}
