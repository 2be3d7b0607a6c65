//! Deterministic in-process devices for bench runs and tests.
//!
//! Switching a simulated device reports the new status (and its nominal
//! power) on the matching channel right away, the way a well-behaved real
//! device would on its next poll.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{BatteryDriver, Channel, Driver, DriverError, InverterDriver, PackChannel, Sink};
use crate::domain::{BatteryPack, DeviceKind, DeviceStatus, KindSet};

/// Republish interval of the simulated poll loops
pub const SIM_POLL_INTERVAL: Duration = Duration::from_secs(10);

fn channels(name: &Arc<str>, kinds: KindSet) -> BTreeMap<DeviceKind, Channel> {
    kinds.iter().map(|k| (k, Channel::new(name, k))).collect()
}

// ============================================================================
// Generic device
// ============================================================================

/// Device of any kinds, drawing or producing a fixed power while on
pub struct SimulatedDevice {
    name: Arc<str>,
    kinds: KindSet,
    power: i32,
    channels: BTreeMap<DeviceKind, Channel>,
    on: Mutex<BTreeMap<DeviceKind, bool>>,
    switches: Mutex<Vec<(DeviceKind, bool)>>,
}

impl SimulatedDevice {
    pub fn new(name: &str, kinds: KindSet) -> Self {
        let name: Arc<str> = Arc::from(name);
        Self {
            channels: channels(&name, kinds),
            name,
            kinds,
            power: 0,
            on: Mutex::new(BTreeMap::new()),
            switches: Mutex::new(Vec::new()),
        }
    }

    /// Watts reported while switched on
    pub fn with_power(mut self, watts: i32) -> Self {
        self.power = watts;
        self
    }

    pub fn report_status(&self, kind: DeviceKind, status: DeviceStatus) {
        if let Some(channel) = self.channels.get(&kind) {
            channel.publish_status(status);
        }
    }

    pub fn report_power(&self, kind: DeviceKind, watts: i32) {
        if let Some(channel) = self.channels.get(&kind) {
            channel.publish_power(watts);
        }
    }

    pub fn report_energy(&self, kind: DeviceKind, wh: u32) {
        if let Some(channel) = self.channels.get(&kind) {
            channel.publish_energy(wh);
        }
    }

    /// Every switch request received, oldest first
    pub fn switch_log(&self) -> Vec<(DeviceKind, bool)> {
        self.switches.lock().clone()
    }

    fn report(&self, kind: DeviceKind, on: bool) {
        let status = if on { DeviceStatus::On } else { DeviceStatus::Off };
        self.report_status(kind, status);
        self.report_power(kind, if on { self.power } else { 0 });
    }
}

#[async_trait]
impl Driver for SimulatedDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn kinds(&self) -> KindSet {
        self.kinds
    }

    fn channel(&self, kind: DeviceKind) -> Option<&Channel> {
        self.channels.get(&kind)
    }

    async fn switch(&self, kind: DeviceKind, on: bool) -> Result<(), DriverError> {
        if !self.kinds.contains(kind) {
            return Err(DriverError::WrongKind(kind));
        }
        self.switches.lock().push((kind, on));
        self.on.lock().insert(kind, on);
        self.report(kind, on);
        Ok(())
    }

    async fn run(&self) {
        let mut ticker = tokio::time::interval(SIM_POLL_INTERVAL);
        loop {
            ticker.tick().await;
            let states: Vec<(DeviceKind, bool)> = self
                .kinds
                .iter()
                .map(|k| (k, self.on.lock().get(&k).copied().unwrap_or(false)))
                .collect();
            for (kind, on) in states {
                self.report(kind, on);
            }
        }
    }
}

// ============================================================================
// Inverter
// ============================================================================

/// Inverter with a continuous power limit in `[min, max]`
pub struct SimulatedInverter {
    name: Arc<str>,
    min: u32,
    max: u32,
    channel: Channel,
    on: Mutex<bool>,
    setpoint: Mutex<u32>,
}

impl SimulatedInverter {
    pub fn new(name: &str, min: u32, max: u32) -> Self {
        let name: Arc<str> = Arc::from(name);
        Self {
            channel: Channel::new(&name, DeviceKind::Inverter),
            name,
            min,
            max: max.max(min),
            on: Mutex::new(false),
            setpoint: Mutex::new(0),
        }
    }

    pub fn setpoint(&self) -> u32 {
        *self.setpoint.lock()
    }

    fn output(&self) -> i32 {
        if *self.on.lock() {
            self.setpoint() as i32
        } else {
            0
        }
    }
}

#[async_trait]
impl Driver for SimulatedInverter {
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
        *self.on.lock() = on;
        self.channel
            .publish_status(if on { DeviceStatus::On } else { DeviceStatus::Off });
        self.channel.publish_power(self.output());
        Ok(())
    }

    async fn run(&self) {
        let mut ticker = tokio::time::interval(SIM_POLL_INTERVAL);
        loop {
            ticker.tick().await;
            self.channel.publish_power(self.output());
        }
    }
}

#[async_trait]
impl InverterDriver for SimulatedInverter {
    async fn set_power(&self, watts: u32) -> Result<u32, DriverError> {
        let applied = watts.clamp(self.min, self.max);
        *self.setpoint.lock() = applied;
        debug!(device = %self.name, requested = watts, applied, "simulated setpoint");
        if *self.on.lock() {
            self.channel.publish_power(applied as i32);
        }
        Ok(applied)
    }

    fn min_power(&self) -> u32 {
        self.min
    }

    fn max_power(&self) -> u32 {
        self.max
    }
}

// ============================================================================
// Battery
// ============================================================================

/// Battery whose snapshots are pushed in, or republished from a template
pub struct SimulatedBattery {
    name: Arc<str>,
    channel: Channel,
    packs: PackChannel,
    template: Mutex<Option<BatteryPack>>,
}

impl SimulatedBattery {
    pub fn new(name: &str) -> Self {
        let name: Arc<str> = Arc::from(name);
        Self {
            channel: Channel::new(&name, DeviceKind::Battery),
            name,
            packs: PackChannel::default(),
            template: Mutex::new(None),
        }
    }

    /// 16-cell LFP pack at rest, republished every poll
    pub fn nominal(name: &str) -> Self {
        let battery = Self::new(name);
        let mut pack = BatteryPack::captured(name);
        pack.cells = vec![3.3; 16];
        pack.v = 52.8;
        pack.soc = 60.0;
        pack.c = 60.0;
        pack.c_full = 100.0;
        pack.temps = vec![20.0, 20.0];
        *battery.template.lock() = Some(pack);
        battery
    }

    /// Publishes `pack` as this battery's latest snapshot
    pub fn push(&self, mut pack: BatteryPack) -> Option<Arc<BatteryPack>> {
        pack.name = self.name.to_string();
        let published = self.packs.publish(pack);
        self.channel.publish_status(if published.is_some() {
            DeviceStatus::On
        } else {
            DeviceStatus::Fault
        });
        published
    }
}

#[async_trait]
impl Driver for SimulatedBattery {
    fn name(&self) -> &str {
        &self.name
    }

    fn kinds(&self) -> KindSet {
        KindSet::of(&[DeviceKind::Battery])
    }

    fn channel(&self, kind: DeviceKind) -> Option<&Channel> {
        (kind == DeviceKind::Battery).then_some(&self.channel)
    }

    async fn switch(&self, _kind: DeviceKind, _on: bool) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("switch"))
    }

    async fn run(&self) {
        let mut ticker = tokio::time::interval(SIM_POLL_INTERVAL);
        loop {
            ticker.tick().await;
            self.read().await;
        }
    }
}

#[async_trait]
impl BatteryDriver for SimulatedBattery {
    async fn read(&self) -> Option<Arc<BatteryPack>> {
        let template = self.template.lock().clone();
        match template {
            Some(mut pack) => {
                pack.timestamp = crate::clock::monotonic_secs();
                self.push(pack)
            }
            None => self.packs.last(),
        }
    }

    fn subscribe_packs(&self, sink: Sink<Arc<BatteryPack>>) {
        self.packs.subscribe(sink);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::battery::fixtures::pack;
    use crate::domain::{DeviceEvent, Measurement};

    #[tokio::test]
    async fn test_device_switch_reports_status_and_power() {
        let device = SimulatedDevice::new("cha", KindSet::of(&[DeviceKind::Charger])).with_power(800);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        device.subscribe(DeviceKind::Charger, Arc::new(move |e: DeviceEvent| sink.lock().push(e.measurement)));

        device.switch(DeviceKind::Charger, true).await.unwrap();
        assert!(device.switch(DeviceKind::Solar, true).await.is_err());
        assert_eq!(
            *seen.lock(),
            vec![Measurement::Status(DeviceStatus::On), Measurement::Power(800)]
        );
        assert_eq!(device.snapshot(DeviceKind::Charger).power, Some(800));
        assert_eq!(device.switch_log(), vec![(DeviceKind::Charger, true)]);
    }

    #[tokio::test]
    async fn test_inverter_clamps_setpoint() {
        let inverter = SimulatedInverter::new("inv", 50, 600);
        assert_eq!(inverter.set_power(900).await.unwrap(), 600);
        assert_eq!(inverter.set_power(10).await.unwrap(), 50);
        inverter.switch(DeviceKind::Inverter, true).await.unwrap();
        assert_eq!(inverter.snapshot(DeviceKind::Inverter).power, Some(50));
    }

    #[tokio::test]
    async fn test_battery_push_and_template() {
        let battery = SimulatedBattery::new("A");
        assert!(battery.read().await.is_none());
        let mut bad = pack("other", 10.0);
        bad.timestamp = 0.0;
        assert!(battery.push(bad).is_none());
        assert_eq!(battery.snapshot(DeviceKind::Battery).status, Some(DeviceStatus::Fault));

        let nominal = SimulatedBattery::nominal("B");
        let first = nominal.read().await.unwrap();
        assert_eq!(first.name, "B");
        assert!(first.is_valid());
    }
}
