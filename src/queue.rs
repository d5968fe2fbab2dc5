//! 有界淘汰队列
//! Bounded evicting queue (drop-oldest).
//!
//! 基于 crossbeam 有界通道: 生产者同时持有接收端, 队列满时从队首弹出最旧元素,
//! 交给清理回调处理后再入队. 入队永远不会阻塞, 也不会报错.
//!
//! 清理回调在调用 `enqueue` / `clear` 的线程上同步执行. 滑动窗口依赖这一点:
//! 它的淘汰回调必须运行在插入帧的线程上.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::error::{PipelineError, PipelineResult};

/// 出队默认超时
pub const DEFAULT_DEQUEUE_TIMEOUT: Duration = Duration::from_millis(500);
/// 异步出队默认轮询间隔
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(30);

type Cleanup<T> = Box<dyn Fn(T) + Send + Sync>;

pub struct BoundedQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    capacity: usize,
    cleanup: Option<Cleanup<T>>,
    max_occupied: AtomicUsize,
    evicted: AtomicUsize,
    timeout: Duration,
    poll_interval: Duration,
}

impl<T> BoundedQueue<T> {
    /// 创建队列. 容量为0属于编程错误, 直接 panic.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "BoundedQueue capacity must be greater than zero");
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            cleanup: None,
            max_occupied: AtomicUsize::new(0),
            evicted: AtomicUsize::new(0),
            timeout: DEFAULT_DEQUEUE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// 由配置驱动的构造: 容量为0时返回配置错误
    pub fn try_new(capacity: usize) -> PipelineResult<Self> {
        if capacity == 0 {
            return Err(PipelineError::Config(
                "queue capacity must be greater than zero".into(),
            ));
        }
        Ok(Self::new(capacity))
    }

    /// 设置清理回调 (淘汰和 `clear` 都走这里). 未设置时直接 drop.
    pub fn with_cleanup<F>(mut self, cleanup: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.cleanup = Some(Box::new(cleanup));
        self
    }

    /// 设置出队超时与轮询间隔
    pub fn with_timing(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.timeout = timeout;
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    /// 非阻塞入队. 满时逐个淘汰最旧元素直到腾出空位.
    pub fn enqueue(&self, item: T) {
        let mut item = item;
        loop {
            match self.tx.try_send(item) {
                Ok(()) => break,
                Err(TrySendError::Full(back)) => {
                    item = back;
                    // 消费者可能恰好取走了元素, 这时直接重试
                    if let Ok(oldest) = self.rx.try_recv() {
                        self.evicted.fetch_add(1, Ordering::Relaxed);
                        self.release(oldest);
                    }
                }
                // 本结构同时持有收发两端, 通道不会断开
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
        self.observe_occupancy();
    }

    /// `None` 为空操作
    pub fn enqueue_opt(&self, item: Option<T>) {
        if let Some(item) = item {
            self.enqueue(item);
        }
    }

    /// 阻塞出队, 最多等待配置的超时. 超时返回 `None`, 不是错误.
    pub fn dequeue(&self) -> Option<T> {
        self.dequeue_timeout(self.timeout)
    }

    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn try_dequeue(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// 清空队列: 逐个出队并调用清理回调, 返回清理的数量
    pub fn clear(&self) -> usize {
        let mut cleared = 0;
        while let Ok(item) = self.rx.try_recv() {
            self.release(item);
            cleared += 1;
        }
        cleared
    }

    pub fn count(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 历史最高占用 (单调不减)
    pub fn max_occupied_ever_observed(&self) -> usize {
        self.max_occupied.load(Ordering::Acquire)
    }

    /// 因容量不足被淘汰的元素总数
    pub fn evicted_count(&self) -> usize {
        self.evicted.load(Ordering::Relaxed)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn release(&self, item: T) {
        match &self.cleanup {
            Some(cleanup) => cleanup(item),
            None => drop(item),
        }
    }

    fn observe_occupancy(&self) {
        let current = self.rx.len();
        let mut seen = self.max_occupied.load(Ordering::Acquire);
        while current > seen {
            match self.max_occupied.compare_exchange_weak(
                seen,
                current,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => seen = actual,
            }
        }
    }
}

impl<T: Send> BoundedQueue<T> {
    pub async fn enqueue_async(&self, item: T) {
        self.enqueue(item);
    }

    /// 异步出队: 按轮询间隔尝试, 直到超时. 不占用运行时线程.
    pub async fn dequeue_async(&self) -> Option<T> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Ok(item) = self.rx.try_recv() {
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}

impl<T> Drop for BoundedQueue<T> {
    fn drop(&mut self) {
        self.clear();
    }
}
