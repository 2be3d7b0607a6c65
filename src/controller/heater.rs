use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tracing::info;

use super::coordinator::ClassCoordinator;
use crate::config::HeaterConfig;
use crate::domain::BatteryPack;

/// Battery heaters driven by the coldest pack temperature, with hysteresis.
///
/// Heating starts at or below `activate_c` and stops at or above
/// `deactivate_c`; between the two the previous decision holds.
pub struct HeaterCoordinator {
    class: Arc<ClassCoordinator>,
    config: HeaterConfig,
    coldest: Mutex<BTreeMap<String, f32>>,
    active: Mutex<Option<bool>>,
    weak: Weak<HeaterCoordinator>,
}

impl HeaterCoordinator {
    pub fn new(class: Arc<ClassCoordinator>, config: HeaterConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            class,
            config,
            coldest: Mutex::new(BTreeMap::new()),
            active: Mutex::new(None),
            weak: weak.clone(),
        })
    }

    pub fn class(&self) -> &Arc<ClassCoordinator> {
        &self.class
    }

    pub fn is_active(&self) -> Option<bool> {
        *self.active.lock()
    }

    /// Minimum temperature over the latest valid snapshot of every pack
    pub fn min_temp(&self) -> Option<f32> {
        self.coldest.lock().values().copied().min_by(f32::total_cmp)
    }

    /// Returns the new heater state when it changed
    pub fn on_pack(&self, pack: &BatteryPack) -> Option<bool> {
        if !pack.is_valid() {
            return None;
        }
        if let Some(t) = pack.min_temp() {
            self.coldest.lock().insert(pack.name.clone(), t);
        }
        let min = self.min_temp()?;

        let decision = {
            let mut active = self.active.lock();
            let next = match *active {
                Some(true) => min < self.config.deactivate_c,
                _ => min <= self.config.activate_c,
            };
            if *active == Some(next) {
                return None;
            }
            *active = Some(next);
            next
        };
        info!(min_temp = min, heating = decision, "heater state change");
        let weak = self.weak.clone();
        self.class.queue().append("heater", move || async move {
            if let Some(this) = weak.upgrade() {
                this.class.command(decision, false).await;
            }
        });
        Some(decision)
    }
}
