//! 车道计数: 每条车道经过的不同目标数 (`lane_counts`) 和当前帧占用 (`lane_occupancy`)

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{json, Map, Value};

use super::AnalysisHandler;
use crate::detection::Frame;
use crate::window::ObjectExpired;
use crate::xbus::{Subscription, XBus};

#[derive(Default)]
struct Counts {
    /// 已计数且仍存活的目标, 过期后释放
    counted: HashSet<String>,
    totals: BTreeMap<usize, u64>,
}

#[derive(Default)]
pub struct LaneCountHandler {
    counts: Arc<Mutex<Counts>>,
}

impl LaneCountHandler {
    pub const COUNTS: &'static str = "lane_counts";
    pub const OCCUPANCY: &'static str = "lane_occupancy";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self, lane: usize) -> u64 {
        self.lock().totals.get(&lane).copied().unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Counts> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn to_json(map: &BTreeMap<usize, u64>) -> Value {
    Value::Object(
        map.iter()
            .map(|(lane, n)| (lane.to_string(), json!(n)))
            .collect::<Map<_, _>>(),
    )
}

impl AnalysisHandler for LaneCountHandler {
    fn name(&self) -> &str {
        "lane_count"
    }

    fn analyze(&mut self, frame: &mut Frame) -> anyhow::Result<()> {
        let mut occupancy: BTreeMap<usize, u64> = BTreeMap::new();
        let totals = {
            let mut counts = self.lock();
            for obj in frame.objects.iter().filter(|o| o.under_analysis) {
                let Some(lane) = obj.lane_index else {
                    continue;
                };
                *occupancy.entry(lane).or_default() += 1;
                if counts.counted.insert(obj.id()) {
                    *counts.totals.entry(lane).or_default() += 1;
                }
            }
            to_json(&counts.totals)
        };
        frame.set_property(Self::COUNTS, totals);
        frame.set_property(Self::OCCUPANCY, to_json(&occupancy));
        Ok(())
    }

    fn on_attach(&mut self, bus: &XBus) -> Vec<Subscription> {
        let counts = Arc::clone(&self.counts);
        vec![bus.subscribe::<ObjectExpired, _>(move |ev| {
            counts
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .counted
                .remove(&ev.object_id);
        })]
    }
}
