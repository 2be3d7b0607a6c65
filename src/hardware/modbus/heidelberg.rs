//! Heidelberg Energy Control wallbox, used as the battery charger.
//!
//! Charging is enabled by writing a non-zero maximum current. The state,
//! power and energy registers are read as one group while holding the
//! port's sequence lock.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use super::port::RtuPort;
use crate::domain::{DeviceKind, DeviceStatus, KindSet};
use crate::hardware::{Channel, Driver, DriverError, FailureCounter, CHARGER_CONFIRM_TIMEOUT};

const REG_CHARGING_STATE: u16 = 4;
const REG_POWER: u16 = 14;
const REG_ENERGY: u16 = 17;
const REG_MAX_CURRENT: u16 = 261;

/// States E and F of IEC 61851
const FAULT_STATES: [u16; 2] = [10, 11];

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const CONFIRM_INTERVAL: Duration = Duration::from_secs(2);
const OFFLINE_AFTER: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Reading {
    state: u16,
    power: u16,
    energy_wh: u32,
    max_current: u16,
}

impl Reading {
    fn status(&self) -> DeviceStatus {
        if FAULT_STATES.contains(&self.state) {
            DeviceStatus::Fault
        } else if self.max_current > 0 {
            DeviceStatus::On
        } else {
            DeviceStatus::Off
        }
    }
}

pub struct Heidelberg {
    name: Arc<str>,
    port: Arc<RtuPort>,
    slave: u8,
    max_current_da: u16,
    channel: Channel,
    failures: FailureCounter,
    last_energy_wh: Mutex<Option<u32>>,
}

impl Heidelberg {
    pub fn new(name: &str, port: Arc<RtuPort>, slave: u8, max_current_da: u16) -> Self {
        let name: Arc<str> = Arc::from(name);
        Self {
            channel: Channel::new(&name, DeviceKind::Charger),
            name,
            port,
            slave,
            max_current_da,
            failures: FailureCounter::new(OFFLINE_AFTER),
            last_energy_wh: Mutex::new(None),
        }
    }

    async fn read_group(&self) -> Result<Reading, DriverError> {
        let sequence = self.port.sequence().await;
        let state = sequence.read_input(self.slave, REG_CHARGING_STATE, 1).await?;
        let power = sequence.read_input(self.slave, REG_POWER, 1).await?;
        let energy = sequence.read_input(self.slave, REG_ENERGY, 2).await?;
        let max_current = sequence.read_holding(self.slave, REG_MAX_CURRENT, 1).await?;
        let first = |regs: &[u16]| regs.first().copied().unwrap_or(0);
        Ok(Reading {
            state: first(&state),
            power: first(&power),
            energy_wh: (first(&energy) as u32) << 16 | energy.get(1).copied().unwrap_or(0) as u32,
            max_current: first(&max_current),
        })
    }

    async fn poll(&self) -> Result<(), DriverError> {
        let reading = self.read_group().await?;
        self.channel.publish_status(reading.status());
        self.channel.publish_power(reading.power as i32);
        let previous = self.last_energy_wh.lock().replace(reading.energy_wh);
        if let Some(previous) = previous {
            self.channel
                .publish_energy(reading.energy_wh.saturating_sub(previous));
        }
        Ok(())
    }

    async fn confirm(&self, current: u16) -> Result<(), DriverError> {
        let deadline = Instant::now() + CHARGER_CONFIRM_TIMEOUT;
        loop {
            let applied = self.port.read_holding(self.slave, REG_MAX_CURRENT, 1).await?;
            if applied.first() == Some(&current) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DriverError::Timeout {
                    op: "charger switch confirmation",
                    after: CHARGER_CONFIRM_TIMEOUT,
                });
            }
            tokio::time::sleep(CONFIRM_INTERVAL).await;
        }
    }
}

#[async_trait]
impl Driver for Heidelberg {
    fn name(&self) -> &str {
        &self.name
    }

    fn kinds(&self) -> KindSet {
        KindSet::of(&[DeviceKind::Charger])
    }

    fn channel(&self, kind: DeviceKind) -> Option<&Channel> {
        (kind == DeviceKind::Charger).then_some(&self.channel)
    }

    async fn switch(&self, kind: DeviceKind, on: bool) -> Result<(), DriverError> {
        if kind != DeviceKind::Charger {
            return Err(DriverError::WrongKind(kind));
        }
        let current = if on { self.max_current_da } else { 0 };
        self.port.write_single(self.slave, REG_MAX_CURRENT, current).await?;
        self.confirm(current).await?;
        info!(device = %self.name, on, current_da = current, "charger switched");
        self.channel
            .publish_status(if on { DeviceStatus::On } else { DeviceStatus::Off });
        Ok(())
    }

    async fn run(&self) {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            ticker.tick().await;
            match self.poll().await {
                Ok(()) => self.failures.success(),
                Err(e) => {
                    warn!(device = %self.name, error = %e, failures = self.failures.count() + 1, "poll failed");
                    if self.failures.failure() {
                        self.channel.publish_status(DeviceStatus::Offline);
                    }
                }
            }
        }
    }
}
