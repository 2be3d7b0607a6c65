use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tokio::time::Instant;

use super::checkers::LiveSource;
use crate::domain::{DeviceEvent, DeviceKind, Measurement};
use crate::hardware::{Driver, Sink, SinkList};

/// Grid meters: total live power is the sum of each meter's latest reading.
pub struct ConsumptionCoordinator {
    meters: Vec<Arc<dyn Driver>>,
    latest: Mutex<BTreeMap<Arc<str>, (i32, Instant)>>,
    sinks: SinkList<i32>,
    weak: Weak<ConsumptionCoordinator>,
}

impl ConsumptionCoordinator {
    pub fn new(meters: Vec<Arc<dyn Driver>>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            meters,
            latest: Mutex::new(BTreeMap::new()),
            sinks: SinkList::new(),
            weak: weak.clone(),
        })
    }

    pub fn attach(&self) {
        for meter in &self.meters {
            let weak = self.weak.clone();
            meter.subscribe(
                DeviceKind::Consumption,
                Arc::new(move |event: DeviceEvent| {
                    if let (Some(this), Measurement::Power(watts)) = (weak.upgrade(), event.measurement) {
                        this.record(event.device, watts, Instant::now());
                    }
                }),
            );
        }
    }

    /// Receives the total on every meter input, changed or not
    pub fn subscribe(&self, sink: Sink<i32>) {
        self.sinks.subscribe(sink);
    }

    pub fn is_empty(&self) -> bool {
        self.meters.is_empty()
    }

    pub fn record(&self, meter: Arc<str>, watts: i32, now: Instant) {
        let total = {
            let mut latest = self.latest.lock();
            latest.insert(meter, (watts, now));
            latest.values().map(|(w, _)| *w).sum::<i32>()
        };
        self.sinks.emit(total);
    }

    pub fn total(&self) -> i32 {
        self.latest.lock().values().map(|(w, _)| *w).sum()
    }
}

impl LiveSource for ConsumptionCoordinator {
    /// Oldest of the meters' last readings; `None` until every meter has reported
    fn last_seen(&self) -> Option<Instant> {
        let latest = self.latest.lock();
        if latest.is_empty() || latest.len() < self.meters.len() {
            return None;
        }
        latest.values().map(|(_, t)| *t).min()
    }
}
