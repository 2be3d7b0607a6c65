//! Growatt MIC/MIN inverter over Modbus RTU.
//!
//! The poll loop walks a 16-step schedule: thirteen output power reads,
//! then one status, one power-limit and one energy read. The limit is a
//! percentage in holding register 3, quantised through the inverter's
//! [`PowerLut`].

use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::port::RtuPort;
use crate::domain::{DeviceKind, DeviceStatus, KindSet, PowerLut};
use crate::hardware::{
    Channel, Driver, DriverError, FailureCounter, InverterDriver, INVERTER_RESET_TIMEOUT,
};

const REG_ON_OFF: u16 = 0;
const REG_ACTIVE_RATE: u16 = 3;
const REG_STATUS: u16 = 0;
const REG_PAC: u16 = 35;
const REG_EAC_TODAY: u16 = 53;

const STATUS_WAITING: u16 = 0;
const STATUS_NORMAL: u16 = 1;
const STATUS_FAULT: u16 = 3;

const STEP_INTERVAL: Duration = Duration::from_secs(1);
const SCHEDULE_LEN: usize = 16;
const OFFLINE_AFTER: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Power,
    Status,
    Limit,
    Energy,
}

fn step(index: usize) -> Step {
    match index % SCHEDULE_LEN {
        13 => Step::Status,
        14 => Step::Limit,
        15 => Step::Energy,
        _ => Step::Power,
    }
}

fn u32_from(regs: &[u16]) -> u32 {
    let mut buf = [0u8; 4];
    BigEndian::write_u16(&mut buf[..2], regs.first().copied().unwrap_or(0));
    BigEndian::write_u16(&mut buf[2..], regs.get(1).copied().unwrap_or(0));
    BigEndian::read_u32(&buf)
}

pub struct Growatt {
    name: Arc<str>,
    port: Arc<RtuPort>,
    slave: u8,
    lut: PowerLut,
    channel: Channel,
    failures: FailureCounter,
    last_yield_wh: Mutex<Option<u32>>,
    limit_percent: Mutex<Option<u8>>,
}

impl Growatt {
    pub fn new(name: &str, port: Arc<RtuPort>, slave: u8, lut: PowerLut) -> Self {
        let name: Arc<str> = Arc::from(name);
        Self {
            channel: Channel::new(&name, DeviceKind::Inverter),
            name,
            port,
            slave,
            lut,
            failures: FailureCounter::new(OFFLINE_AFTER),
            last_yield_wh: Mutex::new(None),
            limit_percent: Mutex::new(None),
        }
    }

    pub fn limit_percent(&self) -> Option<u8> {
        *self.limit_percent.lock()
    }

    async fn read_status(&self) -> Result<DeviceStatus, DriverError> {
        let regs = self.port.read_input(self.slave, REG_STATUS, 1).await?;
        Ok(match regs.first().copied() {
            Some(STATUS_NORMAL) => DeviceStatus::On,
            Some(STATUS_WAITING) => DeviceStatus::Off,
            Some(STATUS_FAULT) => DeviceStatus::Fault,
            _ => DeviceStatus::Syncing,
        })
    }

    async fn poll(&self, index: usize) -> Result<(), DriverError> {
        match step(index) {
            Step::Power => {
                let regs = self.port.read_input(self.slave, REG_PAC, 2).await?;
                // 0.1 W
                self.channel.publish_power((u32_from(&regs) / 10) as i32);
            }
            Step::Status => {
                let status = self.read_status().await?;
                self.channel.publish_status(status);
            }
            Step::Limit => {
                let regs = self.port.read_holding(self.slave, REG_ACTIVE_RATE, 1).await?;
                let percent = regs.first().copied().unwrap_or(0).min(100) as u8;
                let previous = self.limit_percent.lock().replace(percent);
                if previous.is_some_and(|p| p != percent) {
                    warn!(device = %self.name, percent, "power limit changed outside the controller");
                }
            }
            Step::Energy => {
                let regs = self.port.read_input(self.slave, REG_EAC_TODAY, 2).await?;
                // 0.1 kWh
                let today_wh = u32_from(&regs) * 100;
                let previous = self.last_yield_wh.lock().replace(today_wh);
                if let Some(previous) = previous {
                    // the counter restarts at midnight
                    let delta = today_wh.checked_sub(previous).unwrap_or(today_wh);
                    self.channel.publish_energy(delta);
                }
            }
        }
        Ok(())
    }

    /// Waits for the inverter to report normal operation after a restart
    async fn confirm_on(&self) -> Result<(), DriverError> {
        let deadline = Instant::now() + INVERTER_RESET_TIMEOUT;
        loop {
            if let Ok(DeviceStatus::On) = self.read_status().await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DriverError::Timeout {
                    op: "inverter restart",
                    after: INVERTER_RESET_TIMEOUT,
                });
            }
            tokio::time::sleep(STEP_INTERVAL * 2).await;
        }
    }
}

#[async_trait]
impl Driver for Growatt {
    fn name(&self) -> &str {
        &self.name
    }

    fn kinds(&self) -> KindSet {
        KindSet::of(&[DeviceKind::Inverter])
    }

    fn channel(&self, kind: DeviceKind) -> Option<&Channel> {
        (kind == DeviceKind::Inverter).then_some(&self.channel)
    }

    async fn switch(&self, kind: DeviceKind, on: bool) -> Result<(), DriverError> {
        if kind != DeviceKind::Inverter {
            return Err(DriverError::WrongKind(kind));
        }
        self.port.write_single(self.slave, REG_ON_OFF, u16::from(on)).await?;
        info!(device = %self.name, on, "inverter switched");
        if on {
            self.channel.publish_status(DeviceStatus::Syncing);
            self.confirm_on().await?;
            self.channel.publish_status(DeviceStatus::On);
        } else {
            self.channel.publish_status(DeviceStatus::Off);
        }
        Ok(())
    }

    async fn run(&self) {
        let mut ticker = tokio::time::interval(STEP_INTERVAL);
        let mut index = 0usize;
        loop {
            ticker.tick().await;
            match self.poll(index).await {
                Ok(()) => self.failures.success(),
                Err(e) => {
                    warn!(device = %self.name, error = %e, failures = self.failures.count() + 1, "poll failed");
                    if self.failures.failure() {
                        self.channel.publish_status(DeviceStatus::Offline);
                    }
                }
            }
            index = (index + 1) % SCHEDULE_LEN;
        }
    }
}

#[async_trait]
impl InverterDriver for Growatt {
    async fn set_power(&self, watts: u32) -> Result<u32, DriverError> {
        let percent = self.lut.percent_for(watts);
        self.port
            .write_single(self.slave, REG_ACTIVE_RATE, percent as u16)
            .await?;
        *self.limit_percent.lock() = Some(percent);
        let applied = self.lut.power_for(percent);
        debug!(device = %self.name, watts, percent, applied, "power limit written");
        Ok(applied)
    }

    fn min_power(&self) -> u32 {
        self.lut.min_power()
    }

    fn max_power(&self) -> u32 {
        self.lut.max_power()
    }
}
