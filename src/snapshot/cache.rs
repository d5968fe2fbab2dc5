//! 快照缓存 (Snapshot Cache)
//!
//! - 每个目标保留得分最高的 N 张裁剪图, 得分默认为检测框面积
//! - 每帧登记一次完整场景图, 先写入者生效
//! - 订阅目标过期: 可选保存最佳截图, 然后释放该目标的全部截图
//! - 订阅帧过期: 释放该帧的场景图
//!
//! 分析线程写入与总线回调释放可能并发, 两张表都用无锁跳表按键隔离.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_skiplist::SkipMap;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::store::ArtifactStore;
use crate::detection::{Frame, FrameKey};
use crate::window::{FrameExpired, ObjectExpired};
use crate::xbus::{Subscription, XBus};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// 每个目标最多保留的截图数
    pub retention: usize,
    /// 目标过期时保存最佳截图
    pub save_best: bool,
    /// 最佳截图较短边的最小像素数, 小于该值不保存
    pub min_size: u32,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            retention: 5,
            save_best: false,
            min_size: 32,
        }
    }
}

/// 可排序的得分 (全序, NaN 排在最后)
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Score(pub f32);

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Clone, Debug)]
pub struct Snapshot {
    pub score: f32,
    pub frame_id: u64,
    pub image: Arc<RgbImage>,
}

#[derive(Default)]
struct Retention {
    /// 已被过期处理取走, 写入方需要重新建表
    closed: bool,
    entries: BTreeMap<Score, Snapshot>,
}

pub struct SnapshotCache {
    config: SnapshotConfig,
    retention: SkipMap<String, Mutex<Retention>>,
    scenes: SkipMap<FrameKey, Arc<RgbImage>>,
    store: Option<Arc<dyn ArtifactStore>>,
    saved: AtomicUsize,
}

impl SnapshotCache {
    pub fn new(config: SnapshotConfig, store: Option<Arc<dyn ArtifactStore>>) -> Self {
        Self {
            config: SnapshotConfig {
                retention: config.retention.max(1),
                ..config
            },
            retention: SkipMap::new(),
            scenes: SkipMap::new(),
            store,
            saved: AtomicUsize::new(0),
        }
    }

    /// 订阅生命周期事件. 订阅只持有弱引用, 缓存释放后回调变为空操作.
    pub fn attach(self: &Arc<Self>, bus: &XBus) -> Vec<Subscription> {
        let on_object = Arc::downgrade(self);
        let on_frame = Arc::downgrade(self);
        vec![
            bus.subscribe::<ObjectExpired, _>(move |ev| {
                if let Some(cache) = on_object.upgrade() {
                    cache.on_object_expired(ev);
                }
            }),
            bus.subscribe::<FrameExpired, _>(move |ev| {
                if let Some(cache) = on_frame.upgrade() {
                    cache.on_frame_expired(ev);
                }
            }),
        ]
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    /// 登记场景图. 同一帧重复登记不覆盖, 返回是否为首次登记.
    pub fn register_scene(&self, key: FrameKey, image: Arc<RgbImage>) -> bool {
        let entry = self.scenes.get_or_insert(key, Arc::clone(&image));
        Arc::ptr_eq(entry.value(), &image)
    }

    /// 处理一帧: 登记场景, 为分析区域内的目标裁剪截图并写回 `snapshot`.
    /// 返回新增的截图数.
    pub fn update(&self, frame: &mut Frame) -> usize {
        self.register_scene(frame.key(), frame.shared_image());

        let (width, height) = (frame.width(), frame.height());
        let mut inserted = 0;
        for i in 0..frame.objects.len() {
            let obj = &frame.objects[i];
            if !obj.under_analysis {
                continue;
            }
            let Some((x, y, w, h)) = obj.bbox.clamp_to(width, height) else {
                continue;
            };
            let crop = Arc::new(image::imageops::crop_imm(frame.image(), x, y, w, h).to_image());
            let snapshot = Snapshot {
                score: obj.bbox.area(),
                frame_id: frame.frame_id,
                image: Arc::clone(&crop),
            };
            let id = obj.id();
            frame.objects[i].snapshot = Some(crop);
            self.insert_snapshot(&id, snapshot);
            inserted += 1;
        }
        inserted
    }

    /// 写入截图. 超出保留数时淘汰得分最低的; 得分相同则新截图替换旧截图.
    pub fn insert_snapshot(&self, object_id: &str, snapshot: Snapshot) {
        loop {
            let entry = self
                .retention
                .get_or_insert_with(object_id.to_string(), Default::default);
            let mut retention = entry.value().lock().unwrap_or_else(PoisonError::into_inner);
            if retention.closed {
                // 过期处理正在移除旧表
                drop(retention);
                entry.remove();
                continue;
            }
            retention.entries.insert(Score(snapshot.score), snapshot);
            while retention.entries.len() > self.config.retention {
                retention.entries.pop_first();
            }
            return;
        }
    }

    pub fn scene_for(&self, key: &FrameKey) -> Option<Arc<RgbImage>> {
        self.scenes.get(key).map(|e| Arc::clone(e.value()))
    }

    /// 按得分从低到高; 未知目标返回空列表
    pub fn snapshots_for(&self, object_id: &str) -> Vec<Snapshot> {
        self.retention
            .get(object_id)
            .map(|entry| {
                entry
                    .value()
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .entries
                    .values()
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn best_snapshot(&self, object_id: &str) -> Option<Snapshot> {
        let entry = self.retention.get(object_id)?;
        let retention = entry.value().lock().unwrap_or_else(PoisonError::into_inner);
        retention.entries.last_key_value().map(|(_, s)| s.clone())
    }

    pub fn on_object_expired(&self, ev: &ObjectExpired) {
        let Some(entry) = self.retention.get(&ev.object_id) else {
            return;
        };
        let entries = {
            let mut retention = entry.value().lock().unwrap_or_else(PoisonError::into_inner);
            retention.closed = true;
            std::mem::take(&mut retention.entries)
        };
        entry.remove();

        if self.config.save_best {
            if let Some((_, best)) = entries.last_key_value() {
                self.persist(&ev.object_id, best);
            }
        }
        debug!(object = %ev.object_id, released = entries.len(), "📸 释放目标截图");
    }

    pub fn on_frame_expired(&self, ev: &FrameExpired) {
        self.scenes.remove(&ev.key);
    }

    fn persist(&self, object_id: &str, best: &Snapshot) {
        let Some(store) = &self.store else {
            return;
        };
        let (w, h) = best.image.dimensions();
        if w.min(h) < self.config.min_size {
            debug!(object = object_id, "最佳截图 {}x{} 过小, 跳过保存", w, h);
            return;
        }
        match store.save(object_id, &best.image) {
            Ok(()) => {
                self.saved.fetch_add(1, Ordering::Relaxed);
                info!("💾 保存最佳截图: {} (score {:.0}, frame {})", object_id, best.score, best.frame_id);
            }
            Err(e) => warn!("⚠️ 保存截图失败 {}: {}", object_id, e),
        }
    }

    pub fn tracked_objects(&self) -> usize {
        self.retention.len()
    }

    pub fn scene_count(&self) -> usize {
        self.scenes.len()
    }

    /// 成功保存的最佳截图数
    pub fn saved_count(&self) -> usize {
        self.saved.load(Ordering::Relaxed)
    }
}
