//! XBus 消息总线
//! In-process typed publish/subscribe bus.
//!
//! 每种消息类型一个独立频道, 每个频道可以有多个订阅者 (扇出, 不是竞争消费).
//! `post` 在发布者线程上按订阅顺序同步调用所有订阅者; 单个订阅者 panic
//! 会被捕获并记录, 不影响同一消息的其他订阅者.
//!
//! ```ignore
//! let bus = XBus::new();
//! let _sub = bus.subscribe::<FrameExpired, _>(move |ev| {
//!     println!("frame {} expired", ev.frame_id);
//! });
//! bus.post(FrameExpired { .. });
//! ```

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use tracing::error;

type Handler = Arc<dyn Fn(&dyn Any) + Send + Sync>;

#[derive(Default)]
struct Channel {
    handlers: Vec<(u64, Handler)>,
}

#[derive(Default)]
struct BusInner {
    channels: RwLock<HashMap<TypeId, Channel>>,
    next_id: AtomicU64,
}

impl BusInner {
    fn remove(&self, type_id: TypeId, id: u64) {
        let mut channels = self
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(channel) = channels.get_mut(&type_id) {
            channel.handlers.retain(|(hid, _)| *hid != id);
            if channel.handlers.is_empty() {
                channels.remove(&type_id);
            }
        }
    }
}

/// 消息总线句柄, clone 后共享同一组频道
#[derive(Clone, Default)]
pub struct XBus {
    inner: Arc<BusInner>,
}

impl XBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// 订阅消息类型 `E`. 返回的 [`Subscription`] 被 drop 时自动退订.
    pub fn subscribe<E, F>(&self, handler: F) -> Subscription
    where
        E: Any,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let erased: Handler = Arc::new(move |msg: &dyn Any| {
            if let Some(event) = msg.downcast_ref::<E>() {
                handler(event);
            }
        });

        self.inner
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(TypeId::of::<E>())
            .or_default()
            .handlers
            .push((id, erased));

        Subscription {
            bus: Arc::downgrade(&self.inner),
            type_id: TypeId::of::<E>(),
            id,
            active: true,
        }
    }

    /// 同步发布消息, 返回成功处理该消息的订阅者数量
    pub fn post<E: Any>(&self, event: E) -> usize {
        // 先拷贝订阅者列表再释放锁, 订阅者内部可以安全地订阅/退订/再发布
        let handlers: Vec<Handler> = {
            let channels = self
                .inner
                .channels
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            match channels.get(&TypeId::of::<E>()) {
                Some(channel) => channel.handlers.iter().map(|(_, h)| h.clone()).collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for handler in handlers {
            let result = catch_unwind(AssertUnwindSafe(|| handler(&event as &dyn Any)));
            match result {
                Ok(()) => delivered += 1,
                Err(_) => error!(event = type_name::<E>(), "❌ 订阅者处理消息时 panic"),
            }
        }
        delivered
    }

    pub fn subscriber_count<E: Any>(&self) -> usize {
        self.inner
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&TypeId::of::<E>())
            .map_or(0, |c| c.handlers.len())
    }
}

/// 订阅凭证 (RAII). drop 或调用 [`Subscription::unsubscribe`] 时退订.
pub struct Subscription {
    bus: Weak<BusInner>,
    type_id: TypeId,
    id: u64,
    active: bool,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unsubscribe(mut self) {
        self.cancel();
    }

    fn cancel(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.type_id, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}
