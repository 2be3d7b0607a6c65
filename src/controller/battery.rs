use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::checkers::PackSource;
use crate::domain::BatteryPack;
use crate::hardware::{BatteryDriver, Sink, SinkList};

/// Latest validated snapshot per pack, fanned out to heaters and the router.
pub struct BatteryCoordinator {
    drivers: Vec<Arc<dyn BatteryDriver>>,
    packs: Mutex<BTreeMap<String, (Arc<BatteryPack>, Instant)>>,
    sinks: SinkList<Arc<BatteryPack>>,
    started: Instant,
    weak: Weak<BatteryCoordinator>,
}

impl BatteryCoordinator {
    pub fn new(drivers: Vec<Arc<dyn BatteryDriver>>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            drivers,
            packs: Mutex::new(BTreeMap::new()),
            sinks: SinkList::new(),
            started: Instant::now(),
            weak: weak.clone(),
        })
    }

    pub fn attach(&self) {
        for driver in &self.drivers {
            let weak = self.weak.clone();
            driver.subscribe_packs(Arc::new(move |pack: Arc<BatteryPack>| {
                if let Some(this) = weak.upgrade() {
                    this.on_pack(pack, Instant::now());
                }
            }));
        }
    }

    pub fn subscribe(&self, sink: Sink<Arc<BatteryPack>>) {
        self.sinks.subscribe(sink);
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    pub fn on_pack(&self, pack: Arc<BatteryPack>, now: Instant) {
        if !pack.is_valid() {
            debug!(device = %pack.name, "invalid snapshot ignored");
            return;
        }
        self.packs.lock().insert(pack.name.clone(), (pack.clone(), now));
        self.sinks.emit(pack);
    }

    pub fn packs(&self) -> Vec<Arc<BatteryPack>> {
        self.packs.lock().values().map(|(p, _)| p.clone()).collect()
    }

    /// Sum of remaining capacity (Ah) over the latest snapshots
    pub fn total_capacity(&self) -> f32 {
        self.packs.lock().values().map(|(p, _)| p.c).sum()
    }
}

impl PackSource for BatteryCoordinator {
    /// Age of the stalest pack; a pack never seen counts from startup
    fn oldest_pack_age(&self, now: Instant) -> Option<Duration> {
        let packs = self.packs.lock();
        self.drivers
            .iter()
            .map(|d| {
                let since = packs.get(d.name()).map(|(_, t)| *t).unwrap_or(self.started);
                now.saturating_duration_since(since)
            })
            .max()
    }

    fn cell_extremes(&self) -> Option<(f32, f32)> {
        let packs = self.packs.lock();
        let min = packs.values().filter_map(|(p, _)| p.min_cell()).min_by(f32::total_cmp)?;
        let max = packs.values().filter_map(|(p, _)| p.max_cell()).max_by(f32::total_cmp)?;
        Some((min, max))
    }
}
