use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::coordinator::{ClassCoordinator, ClassEvent};
use super::netzero::NetZero;
use super::trigger::Trigger;
use crate::config::{InverterConfig, NetZeroConfig};
use crate::domain::DeviceStatus;
use crate::hardware::InverterDriver;

/// Splits `target` across inverters with per-device `(min, max)` bounds.
///
/// Even share first, the remainder on the leading devices; each share is
/// then clamped to its device's range.
pub fn split_evenly(target: u32, limits: &[(u32, u32)]) -> Vec<u32> {
    if limits.is_empty() {
        return Vec::new();
    }
    let n = limits.len() as u32;
    let base = target / n;
    let remainder = target % n;
    limits
        .iter()
        .enumerate()
        .map(|(i, (min, max))| {
            let share = base + u32::from((i as u32) < remainder);
            share.clamp(*min, (*max).max(*min))
        })
        .collect()
}

#[derive(Debug, Default)]
struct InverterState {
    /// Sum of setpoints actually applied
    setpoint: u32,
    was_on: bool,
}

/// Inverter class: class coordination plus the net-zero loop.
pub struct InverterCoordinator {
    class: Arc<ClassCoordinator>,
    inverters: Vec<Arc<dyn InverterDriver>>,
    netzero: Mutex<NetZero>,
    state: Mutex<InverterState>,
    default_power: u32,
    weak: Weak<InverterCoordinator>,
}

impl InverterCoordinator {
    pub fn new(
        class: Arc<ClassCoordinator>,
        inverters: Vec<Arc<dyn InverterDriver>>,
        inverter: &InverterConfig,
        netzero: NetZeroConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            class,
            inverters,
            netzero: Mutex::new(NetZero::new(netzero)),
            state: Mutex::new(InverterState::default()),
            default_power: inverter.default_power,
            weak: weak.clone(),
        })
    }

    /// Subscribes to the inverter class events
    pub fn attach(&self) {
        let weak = self.weak.clone();
        self.class.subscribe(Arc::new(move |event: ClassEvent| {
            if let Some(this) = weak.upgrade() {
                this.on_class_event(event);
            }
        }));
    }

    pub fn class(&self) -> &Arc<ClassCoordinator> {
        &self.class
    }

    pub fn setpoint(&self) -> u32 {
        self.state.lock().setpoint
    }

    pub fn netzero_enabled(&self) -> bool {
        self.netzero.lock().config().enabled
    }

    pub fn min_power(&self) -> u32 {
        self.inverters.iter().map(|i| i.min_power()).sum()
    }

    pub fn max_power(&self) -> u32 {
        self.inverters.iter().map(|i| i.max_power()).sum()
    }

    fn on_class_event(&self, event: ClassEvent) {
        let ClassEvent::Status { status, .. } = event else {
            return;
        };
        self.netzero.lock().clear();
        let was_on = {
            let mut state = self.state.lock();
            std::mem::replace(&mut state.was_on, status == DeviceStatus::On)
        };
        if status == DeviceStatus::On && !was_on {
            info!(watts = self.default_power, "inverters on, applying default power");
            self.enqueue_setpoint(self.default_power);
        } else if status != DeviceStatus::On && was_on {
            info!(%status, "inverters left on");
            self.state.lock().setpoint = 0;
            self.class.force_power(0);
        }
    }

    /// Grid consumption sample from the consumption class
    pub fn on_live_consumption(&self, watts: i32) {
        if !self.state.lock().was_on {
            return;
        }
        let mut netzero = self.netzero.lock();
        if netzero.config().enabled {
            netzero.add(Instant::now(), watts);
        }
    }

    /// Net-zero step: returns the new class target if one is due
    pub fn evaluate(&self, now: Instant) -> Option<u32> {
        if !self.state.lock().was_on {
            return None;
        }
        let delta = {
            let mut netzero = self.netzero.lock();
            if !netzero.config().enabled {
                return None;
            }
            netzero.evaluate(now)
        };
        if delta == 0 {
            return None;
        }
        let current = self.state.lock().setpoint as i64;
        let (lo, hi) = (self.min_power() as i64, self.max_power() as i64);
        let target = (current + delta as i64).clamp(lo, hi.max(lo)) as u32;
        (target as i64 != current).then_some(target)
    }

    pub fn on_trigger(&self, trigger: Trigger) -> anyhow::Result<()> {
        if trigger == Trigger::Every6s {
            if let Some(target) = self.evaluate(Instant::now()) {
                debug!(target, "net-zero target");
                self.enqueue_setpoint(target);
            }
        }
        Ok(())
    }

    fn enqueue_setpoint(&self, target: u32) {
        let weak = self.weak.clone();
        self.class.queue().append("setpoint", move || async move {
            if let Some(this) = weak.upgrade() {
                this.apply(target).await;
            }
        });
    }

    /// Distributes `target` across inverters; records what they actually accepted
    pub async fn apply(&self, target: u32) {
        let limits: Vec<(u32, u32)> = self.inverters.iter().map(|i| (i.min_power(), i.max_power())).collect();
        let shares = split_evenly(target, &limits);
        let mut applied = 0u32;
        for (inverter, share) in self.inverters.iter().zip(shares) {
            match inverter.set_power(share).await {
                Ok(actual) => applied = applied.saturating_add(actual),
                Err(e) => warn!(device = inverter.name(), watts = share, error = %e, "set_power failed"),
            }
        }
        self.state.lock().setpoint = applied;
        self.netzero.lock().clear();
        debug!(target, applied, "inverter setpoint applied");
    }
}
