//! 停留时长: 记录每个目标首次出现的时间偏移, 每帧写入 `dwell_ms`

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{json, Map, Value};
use tracing::info;

use super::AnalysisHandler;
use crate::detection::Frame;
use crate::window::ObjectExpired;
use crate::xbus::{Subscription, XBus};

#[derive(Clone, Copy, Debug)]
struct Visit {
    first_ms: u64,
    last_ms: u64,
}

#[derive(Default)]
pub struct DwellTimeHandler {
    visits: Arc<Mutex<HashMap<String, Visit>>>,
    completed: Arc<AtomicUsize>,
}

impl DwellTimeHandler {
    pub const PROPERTY: &'static str = "dwell_ms";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_count(&self) -> usize {
        self.visits.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// 已结束 (目标过期) 的停留次数
    pub fn completed_count(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }
}

impl AnalysisHandler for DwellTimeHandler {
    fn name(&self) -> &str {
        "dwell_time"
    }

    fn analyze(&mut self, frame: &mut Frame) -> anyhow::Result<()> {
        let mut dwell = Map::new();
        {
            let mut visits = self.visits.lock().unwrap_or_else(PoisonError::into_inner);
            for obj in frame.objects.iter().filter(|o| o.under_analysis) {
                let visit = visits.entry(obj.id()).or_insert(Visit {
                    first_ms: frame.offset_ms,
                    last_ms: frame.offset_ms,
                });
                visit.last_ms = visit.last_ms.max(frame.offset_ms);
                dwell.insert(
                    obj.id(),
                    json!(frame.offset_ms.saturating_sub(visit.first_ms)),
                );
            }
        }
        frame.set_property(Self::PROPERTY, Value::Object(dwell));
        Ok(())
    }

    fn on_attach(&mut self, bus: &XBus) -> Vec<Subscription> {
        let visits = Arc::clone(&self.visits);
        let completed = Arc::clone(&self.completed);
        vec![bus.subscribe::<ObjectExpired, _>(move |ev| {
            let visit = visits
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&ev.object_id);
            if let Some(visit) = visit {
                completed.fetch_add(1, Ordering::Relaxed);
                info!(
                    "⏱️  {} 停留 {} ms ({} → {})",
                    ev.object_id,
                    visit.last_ms - visit.first_ms,
                    visit.first_ms,
                    visit.last_ms
                );
            }
        })]
    }
}
