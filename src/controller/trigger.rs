use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Fast tick period
pub const TICK: Duration = Duration::from_secs(6);
/// Reporting window, aligned to wall-clock five minute boundaries
pub const WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Every6s,
    Every300s,
}

pub type TriggerHandler = Arc<dyn Fn(Trigger) -> anyhow::Result<()> + Send + Sync>;

/// Periodic fan-out of [`Trigger`]s to subscribers in registration order
#[derive(Default)]
pub struct TriggerBus {
    subscribers: Mutex<Vec<(&'static str, TriggerHandler)>>,
}

impl TriggerBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, name: &'static str, handler: TriggerHandler) {
        self.subscribers.lock().push((name, handler));
    }

    /// Calls every subscriber; a failing subscriber does not stop the others
    pub fn fire(&self, trigger: Trigger) {
        let subscribers = self.subscribers.lock().clone();
        for (name, handler) in subscribers {
            if let Err(e) = handler(trigger) {
                warn!(subscriber = name, ?trigger, error = %e, "trigger subscriber failed");
            }
        }
    }

    pub async fn run(&self) {
        let mut alignment = WindowAlignment::default();
        loop {
            let wait = delay_to_boundary(Utc::now().timestamp_millis(), TICK);
            tokio::time::sleep(wait).await;

            let tick_ms = Utc::now().timestamp_millis();
            self.fire(Trigger::Every6s);
            if alignment.observe(tick_ms) {
                debug!(tick_ms, "five minute boundary");
                self.fire(Trigger::Every300s);
            }
        }
    }
}

/// Time until the next multiple of `period` on the wall clock
pub fn delay_to_boundary(now_ms: i64, period: Duration) -> Duration {
    let period_ms = period.as_millis().max(1) as i64;
    let remainder = now_ms.rem_euclid(period_ms);
    Duration::from_millis((period_ms - remainder) as u64)
}

/// Detects ticks that cross into a new five minute window.
///
/// Recomputed from wall time on every tick, so the window stays aligned
/// however long the process runs.
#[derive(Debug, Default)]
pub struct WindowAlignment {
    last_window: Option<i64>,
}

impl WindowAlignment {
    pub fn observe(&mut self, tick_ms: i64) -> bool {
        let window = tick_ms.div_euclid(WINDOW.as_millis() as i64);
        let crossed = matches!(self.last_window, Some(last) if window > last);
        self.last_window = Some(window);
        crossed
    }
}
