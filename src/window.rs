//! 滑动窗口 (Slide Window)
//!
//! 保存最近 N 帧, 并维护 `目标ID → 引用它的窗口内帧` 的成员表.
//! 帧被淘汰时 (容量超出或 `close`), 在插入线程上同步发布:
//! 先为不再被任何窗口内帧引用的目标发布 [`ObjectExpired`], 再发布该帧的 [`FrameExpired`].
//!
//! 成员表只由 `add_frame` 及其同步触发的淘汰回调修改; 互斥锁只与只读查询竞争.
//! 事件总是在释放锁之后发布, 订阅者可以在回调中查询窗口.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::detection::{Frame, FrameKey};
use crate::error::PipelineResult;
use crate::queue::BoundedQueue;
use crate::xbus::XBus;

/// 目标不再被窗口内任何帧引用
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectExpired {
    pub device_id: String,
    pub object_id: String,
    pub label: String,
    pub label_id: u32,
    pub tracking_id: u32,
}

/// 帧离开窗口, 资源即将释放
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameExpired {
    pub key: FrameKey,
    pub offset_ms: u64,
    /// 该帧包含的目标ID (按检测顺序)
    pub object_ids: Vec<String>,
}

#[derive(Default)]
struct Membership {
    frames: HashMap<String, BTreeMap<FrameKey, Arc<Frame>>>,
}

impl Membership {
    fn insert(&mut self, frame: &Arc<Frame>) {
        let key = frame.key();
        for obj in &frame.objects {
            self.frames
                .entry(obj.id())
                .or_default()
                .insert(key.clone(), Arc::clone(frame));
        }
    }

    /// 从成员表移除帧, 返回因此失效的目标
    fn remove(&mut self, frame: &Frame) -> Vec<ObjectExpired> {
        let key = frame.key();
        let mut expired = Vec::new();
        for obj in &frame.objects {
            let id = obj.id();
            // 同一帧内重复的ID只处理一次: 第二次查不到条目
            let Some(set) = self.frames.get_mut(&id) else {
                continue;
            };
            set.remove(&key);
            if set.is_empty() {
                self.frames.remove(&id);
                expired.push(ObjectExpired {
                    device_id: frame.device_id.clone(),
                    object_id: id,
                    label: obj.label.clone(),
                    label_id: obj.label_id(),
                    tracking_id: obj.tracking_id,
                });
            }
        }
        expired
    }
}

pub struct SlideWindow {
    queue: BoundedQueue<Arc<Frame>>,
    membership: Arc<Mutex<Membership>>,
}

impl SlideWindow {
    /// 窗口大小为0属于编程错误, 直接 panic
    pub fn new(size: usize, bus: XBus) -> Self {
        let membership = Arc::new(Mutex::new(Membership::default()));
        let state = Arc::clone(&membership);
        let queue = BoundedQueue::new(size).with_cleanup(move |frame: Arc<Frame>| {
            let expired = state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&frame);
            debug!(
                frame = %frame.key(),
                expired_objects = expired.len(),
                "🪟 帧离开窗口"
            );
            for event in expired {
                bus.post(event);
            }
            bus.post(FrameExpired {
                key: frame.key(),
                offset_ms: frame.offset_ms,
                object_ids: frame.object_ids(),
            });
            // 窗口持有的引用在这里释放
            drop(frame);
        });
        Self { queue, membership }
    }

    pub fn try_new(size: usize, bus: XBus) -> PipelineResult<Self> {
        // 复用队列的容量校验
        BoundedQueue::<()>::try_new(size)?;
        Ok(Self::new(size, bus))
    }

    /// 插入帧. 超出容量时恰好淘汰最旧的一帧, 事件在本线程同步发布.
    ///
    /// 新帧的成员关系先于淘汰登记: 同时出现在被淘汰帧和新帧中的目标始终存活.
    pub fn add_frame(&self, frame: Arc<Frame>) {
        self.lock().insert(&frame);
        self.queue.enqueue(frame);
    }

    /// 窗口内包含该目标的帧, 按帧序号排序; 未知目标返回空列表
    pub fn frames_containing(&self, object_id: &str) -> Vec<Arc<Frame>> {
        self.lock()
            .frames
            .get(object_id)
            .map(|set| set.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_alive(&self, object_id: &str) -> bool {
        self.lock().frames.contains_key(object_id)
    }

    pub fn alive_count(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn alive_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().frames.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.queue.count()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// 因容量超出被淘汰的帧数 (不含 `close`)
    pub fn evicted_count(&self) -> usize {
        self.queue.evicted_count()
    }

    /// 按插入顺序淘汰所有驻留帧, 与普通淘汰发布相同的事件. 返回淘汰的帧数.
    pub fn close(&self) -> usize {
        let flushed = self.queue.clear();
        if flushed > 0 {
            debug!(frames = flushed, "🪟 窗口关闭, 已清空");
        }
        flushed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Membership> {
        self.membership
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SlideWindow {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{BBox, DetectedObject};
    use image::RgbImage;

    fn frame(id: u64, objects: &[(&str, u32)]) -> Arc<Frame> {
        let objects = objects
            .iter()
            .map(|(label, tid)| {
                DetectedObject::new(*label, BBox::new(0.0, 0.0, 4.0, 4.0, 0.9, 1))
                    .with_tracking_id(*tid)
            })
            .collect();
        Arc::new(Frame::new("cam", id, id * 40, RgbImage::new(4, 4)).with_objects(objects))
    }

    /// 记录所有事件, 形如 "obj:car:1" / "frame:3"
    fn record(bus: &XBus) -> (Arc<Mutex<Vec<String>>>, Vec<crate::xbus::Subscription>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l1 = Arc::clone(&log);
        let l2 = Arc::clone(&log);
        let subs = vec![
            bus.subscribe::<ObjectExpired, _>(move |ev| {
                l1.lock().unwrap().push(format!("obj:{}", ev.object_id))
            }),
            bus.subscribe::<FrameExpired, _>(move |ev| {
                l2.lock().unwrap().push(format!("frame:{}", ev.key.frame_id))
            }),
        ];
        (log, subs)
    }

    #[test]
    fn test_single_object_single_frame() {
        let window = SlideWindow::new(3, XBus::new());
        window.add_frame(frame(1, &[("car", 1)]));
        assert_eq!(window.frames_containing("car:1").len(), 1);
        assert!(window.is_alive("car:1"));
        assert!(!window.is_alive("car:2"));
        assert!(window.frames_containing("car:2").is_empty());
    }

    #[test]
    fn test_eviction_publishes_objects_before_frame() {
        let bus = XBus::new();
        let (log, _subs) = record(&bus);
        let window = SlideWindow::new(2, bus);

        window.add_frame(frame(1, &[("car", 1), ("person", 7)]));
        window.add_frame(frame(2, &[("person", 7)]));
        assert!(log.lock().unwrap().is_empty());

        window.add_frame(frame(3, &[]));
        assert_eq!(*log.lock().unwrap(), vec!["obj:car:1", "frame:1"]);
        assert_eq!(window.len(), 2);
        assert_eq!(window.evicted_count(), 1);
        assert!(window.is_alive("person:7"));
    }

    #[test]
    fn test_expired_event_carries_identity() {
        let bus = XBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = bus.subscribe::<ObjectExpired, _>(move |ev| sink.lock().unwrap().push(ev.clone()));
        let window = SlideWindow::new(1, bus);

        window.add_frame(frame(1, &[("bus", 5)]));
        window.add_frame(frame(2, &[]));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![ObjectExpired {
                device_id: "cam".into(),
                object_id: "bus:5".into(),
                label: "bus".into(),
                label_id: 1,
                tracking_id: 5,
            }]
        );
    }

    #[test]
    fn test_object_in_evicted_and_new_frame_stays_alive() {
        let bus = XBus::new();
        let (log, _subs) = record(&bus);
        let window = SlideWindow::new(1, bus);

        window.add_frame(frame(1, &[("car", 1)]));
        // 新帧的成员关系先登记, 再淘汰旧帧. 若先入队后登记, 这里会先发布 car:1 过期,
        // 随后同一目标又在帧2中复活; 窗口内一直有帧引用 car:1, 不应视为过期.
        window.add_frame(frame(2, &[("car", 1)]));
        assert_eq!(*log.lock().unwrap(), vec!["frame:1"]);
        assert!(window.is_alive("car:1"));
        assert_eq!(window.frames_containing("car:1").len(), 1);
    }

    #[test]
    fn test_duplicate_ids_in_one_frame_expire_once() {
        let bus = XBus::new();
        let (log, _subs) = record(&bus);
        let window = SlideWindow::new(1, bus);

        window.add_frame(frame(1, &[("car", 1), ("car", 1)]));
        assert_eq!(window.frames_containing("car:1").len(), 1);
        window.add_frame(frame(2, &[]));
        assert_eq!(*log.lock().unwrap(), vec!["obj:car:1", "frame:1"]);
    }

    #[test]
    fn test_close_flushes_every_resident_frame() {
        let bus = XBus::new();
        let (log, _subs) = record(&bus);
        let window = SlideWindow::new(5, bus);
        window.add_frame(frame(1, &[("car", 1)]));
        window.add_frame(frame(2, &[("car", 1), ("person", 2)]));

        assert_eq!(window.close(), 2);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["frame:1", "obj:car:1", "obj:person:2", "frame:2"]
        );
        assert_eq!(window.alive_count(), 0);
        assert_eq!(window.close(), 0);
    }

    #[test]
    fn test_drop_flushes_events() {
        let bus = XBus::new();
        let (log, _subs) = record(&bus);
        {
            let window = SlideWindow::new(3, bus.clone());
            window.add_frame(frame(9, &[("dog", 3)]));
        }
        assert_eq!(*log.lock().unwrap(), vec!["obj:dog:3", "frame:9"]);
    }

    #[test]
    fn test_frame_released_after_eviction() {
        let window = SlideWindow::new(1, XBus::new());
        let first = frame(1, &[("car", 1)]);
        window.add_frame(Arc::clone(&first));
        // 队列 + 成员表各持有一份
        assert_eq!(Arc::strong_count(&first), 3);
        window.add_frame(frame(2, &[]));
        assert_eq!(Arc::strong_count(&first), 1);
    }

    #[test]
    fn test_subscriber_can_query_window() {
        let bus = XBus::new();
        let window = Arc::new(SlideWindow::new(2, bus.clone()));
        let weak = Arc::downgrade(&window);
        let alive_during_event = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&alive_during_event);
        let _sub = bus.subscribe::<ObjectExpired, _>(move |ev| {
            if let Some(window) = weak.upgrade() {
                sink.lock()
                    .unwrap()
                    .push((ev.object_id.clone(), window.is_alive(&ev.object_id)));
            }
        });

        window.add_frame(frame(1, &[("car", 1)]));
        window.add_frame(frame(2, &[]));
        window.add_frame(frame(3, &[]));
        assert_eq!(
            *alive_during_event.lock().unwrap(),
            vec![("car:1".to_string(), false)]
        );
    }

    #[test]
    fn test_try_new_rejects_zero() {
        assert!(SlideWindow::try_new(0, XBus::new()).is_err());
    }
}
