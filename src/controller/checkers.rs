//! Built-in safety checkers and the sources they observe.
//!
//! | Checker | Prio | Blocks | Fatal |
//! |---|---|---|---|
//! | `internal` | 1 | charger, inverter, solar | yes |
//! | `startup` | 2 | charger, inverter, solar | no |
//! | `mqtt_offline` | 5 | charger, inverter | yes |
//! | `live_data_lost_discharge` | 10 | inverter | no |
//! | `live_data_lost_charge` | 11 | charger | no |
//! | `battery_offline` | 30 | charger, solar, inverter | no |
//! | `cell_high` | 31 | charger, solar | no |
//! | `cell_low` | 32 | inverter | no |

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::domain::{DeviceKind, KindSet, LockReason, LockSet};

const CHARGER: DeviceKind = DeviceKind::Charger;
const INVERTER: DeviceKind = DeviceKind::Inverter;
const SOLAR: DeviceKind = DeviceKind::Solar;

pub fn internal_reason() -> LockReason {
    LockReason::new("internal", 1, KindSet::of(&[CHARGER, INVERTER, SOLAR]), true)
}
pub fn startup_reason() -> LockReason {
    LockReason::new("startup", 2, KindSet::of(&[CHARGER, INVERTER, SOLAR]), false)
}
pub fn mqtt_offline_reason() -> LockReason {
    LockReason::new("mqtt_offline", 5, KindSet::of(&[CHARGER, INVERTER]), true)
}
pub fn live_data_lost_discharge_reason() -> LockReason {
    LockReason::new("live_data_lost_discharge", 10, KindSet::of(&[INVERTER]), false)
}
pub fn live_data_lost_charge_reason() -> LockReason {
    LockReason::new("live_data_lost_charge", 11, KindSet::of(&[CHARGER]), false)
}
pub fn battery_offline_reason() -> LockReason {
    LockReason::new("battery_offline", 30, KindSet::of(&[CHARGER, SOLAR, INVERTER]), false)
}
pub fn cell_high_reason() -> LockReason {
    LockReason::new("cell_high", 31, KindSet::of(&[CHARGER, SOLAR]), false)
}
pub fn cell_low_reason() -> LockReason {
    LockReason::new("cell_low", 32, KindSet::of(&[INVERTER]), false)
}

/// Battery view needed by the battery checkers
pub trait PackSource: Send + Sync {
    fn oldest_pack_age(&self, now: Instant) -> Option<Duration>;
    /// (lowest, highest) cell voltage across the latest snapshots
    fn cell_extremes(&self) -> Option<(f32, f32)>;
}

/// Consumption view needed by the live-data checkers
pub trait LiveSource: Send + Sync {
    fn last_seen(&self) -> Option<Instant>;
}

/// Broker connection state
pub trait LinkStatus: Send + Sync {
    /// Start of the current outage, `None` while connected
    fn disconnected_since(&self) -> Option<Instant>;
}

pub struct CheckContext<'a> {
    pub now: Instant,
    pub locks: &'a LockSet,
}

/// One safety condition evaluated by the supervisor.
///
/// `Ok(Some(true))` activates the reason, `Ok(Some(false))` releases it and
/// `Ok(None)` leaves it as is. An error aborts the check round.
pub trait Checker: Send {
    fn reason(&self) -> &LockReason;

    fn check(&mut self, ctx: &CheckContext<'_>) -> anyhow::Result<Option<bool>>;
}

/// Active until no other lock has been seen for the quiet period
pub struct StartupChecker {
    reason: LockReason,
    quiet_for: Duration,
    quiet_since: Option<Instant>,
    released: bool,
}

impl StartupChecker {
    pub fn new(quiet_for: Duration) -> Self {
        Self {
            reason: startup_reason(),
            quiet_for,
            quiet_since: None,
            released: false,
        }
    }
}

impl Checker for StartupChecker {
    fn reason(&self) -> &LockReason {
        &self.reason
    }

    fn check(&mut self, ctx: &CheckContext<'_>) -> anyhow::Result<Option<bool>> {
        if self.released {
            return Ok(None);
        }
        if ctx.locks.any_except(self.reason.name) {
            self.quiet_since = None;
            return Ok(Some(true));
        }
        let since = *self.quiet_since.get_or_insert(ctx.now);
        if ctx.now.saturating_duration_since(since) >= self.quiet_for {
            self.released = true;
            return Ok(Some(false));
        }
        Ok(Some(true))
    }
}

pub struct MqttOfflineChecker {
    reason: LockReason,
    link: Arc<dyn LinkStatus>,
    threshold: Duration,
}

impl MqttOfflineChecker {
    pub fn new(link: Arc<dyn LinkStatus>, threshold: Duration) -> Self {
        Self {
            reason: mqtt_offline_reason(),
            link,
            threshold,
        }
    }
}

impl Checker for MqttOfflineChecker {
    fn reason(&self) -> &LockReason {
        &self.reason
    }

    fn check(&mut self, ctx: &CheckContext<'_>) -> anyhow::Result<Option<bool>> {
        Ok(Some(match self.link.disconnected_since() {
            Some(since) => ctx.now.saturating_duration_since(since) > self.threshold,
            None => false,
        }))
    }
}

/// No consumption sample for longer than the threshold
pub struct LiveDataChecker {
    reason: LockReason,
    source: Arc<dyn LiveSource>,
    threshold: Duration,
    started: Instant,
}

impl LiveDataChecker {
    pub fn discharge(source: Arc<dyn LiveSource>, threshold: Duration, started: Instant) -> Self {
        Self {
            reason: live_data_lost_discharge_reason(),
            source,
            threshold,
            started,
        }
    }

    pub fn charge(source: Arc<dyn LiveSource>, threshold: Duration, started: Instant) -> Self {
        Self {
            reason: live_data_lost_charge_reason(),
            source,
            threshold,
            started,
        }
    }
}

impl Checker for LiveDataChecker {
    fn reason(&self) -> &LockReason {
        &self.reason
    }

    fn check(&mut self, ctx: &CheckContext<'_>) -> anyhow::Result<Option<bool>> {
        let last = self.source.last_seen().unwrap_or(self.started);
        Ok(Some(ctx.now.saturating_duration_since(last) > self.threshold))
    }
}

pub struct BatteryOfflineChecker {
    reason: LockReason,
    source: Arc<dyn PackSource>,
    threshold: Duration,
}

impl BatteryOfflineChecker {
    pub fn new(source: Arc<dyn PackSource>, threshold: Duration) -> Self {
        Self {
            reason: battery_offline_reason(),
            source,
            threshold,
        }
    }
}

impl Checker for BatteryOfflineChecker {
    fn reason(&self) -> &LockReason {
        &self.reason
    }

    fn check(&mut self, ctx: &CheckContext<'_>) -> anyhow::Result<Option<bool>> {
        Ok(self.source.oldest_pack_age(ctx.now).map(|age| age > self.threshold))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    High,
    Low,
}

/// Cell voltage limit with release hysteresis
pub struct CellLimitChecker {
    reason: LockReason,
    source: Arc<dyn PackSource>,
    direction: Direction,
    limit: f32,
    hysteresis: f32,
    active: bool,
}

impl CellLimitChecker {
    pub fn high(source: Arc<dyn PackSource>, limit: f32, hysteresis: f32) -> Self {
        Self {
            reason: cell_high_reason(),
            source,
            direction: Direction::High,
            limit,
            hysteresis,
            active: false,
        }
    }

    pub fn low(source: Arc<dyn PackSource>, limit: f32, hysteresis: f32) -> Self {
        Self {
            reason: cell_low_reason(),
            source,
            direction: Direction::Low,
            limit,
            hysteresis,
            active: false,
        }
    }
}

impl Checker for CellLimitChecker {
    fn reason(&self) -> &LockReason {
        &self.reason
    }

    fn check(&mut self, _ctx: &CheckContext<'_>) -> anyhow::Result<Option<bool>> {
        let Some((lowest, highest)) = self.source.cell_extremes() else {
            return Ok(None);
        };
        self.active = match self.direction {
            Direction::High if self.active => highest > self.limit - self.hysteresis,
            Direction::High => highest > self.limit,
            Direction::Low if self.active => lowest < self.limit + self.hysteresis,
            Direction::Low => lowest < self.limit,
        };
        Ok(Some(self.active))
    }
}
