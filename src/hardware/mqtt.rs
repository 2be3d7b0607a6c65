//! Devices whose data arrives over the MQTT link instead of being polled.
//!
//! [`MqttMeter`] turns the live consumption topic into a consumption
//! channel. [`MqttBattery`] accepts packs forwarded by another controller
//! on `{root}/bat/fwd/{name}`. Both go offline when their topic stays
//! silent.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{BatteryDriver, Channel, Driver, DriverError, PackChannel, Sink};
use crate::clock;
use crate::domain::{BatteryPack, DeviceKind, DeviceStatus, KindSet};
use crate::io::mqtt::{Inbound, MqttLink};
use crate::io::payload::decode_power;

/// Silence after which an inbound-fed device is reported offline
pub const STALE_AFTER: Duration = Duration::from_secs(120);
const CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Arrival time of the last accepted message, shared by both drivers
#[derive(Debug, Default)]
struct Freshness {
    last: Mutex<Option<Instant>>,
    offline: Mutex<bool>,
}

impl Freshness {
    fn touch(&self, now: Instant) {
        *self.last.lock() = Some(now);
        *self.offline.lock() = false;
    }

    /// True exactly once per stale period
    fn went_stale(&self, now: Instant, started: Instant) -> bool {
        let since = self.last.lock().unwrap_or(started);
        let mut offline = self.offline.lock();
        if !*offline && now.saturating_duration_since(since) >= STALE_AFTER {
            *offline = true;
            return true;
        }
        false
    }
}

async fn watch_staleness(name: &str, channel: &Channel, freshness: &Freshness) {
    let started = Instant::now();
    let mut ticker = tokio::time::interval(CHECK_INTERVAL);
    loop {
        ticker.tick().await;
        if freshness.went_stale(Instant::now(), started) {
            warn!(device = name, after = ?STALE_AFTER, "no inbound data");
            channel.publish_status(DeviceStatus::Offline);
        }
    }
}

pub struct MqttMeter {
    name: Arc<str>,
    channel: Channel,
    freshness: Freshness,
}

impl MqttMeter {
    pub fn new(name: &str) -> Arc<Self> {
        let name: Arc<str> = Arc::from(name);
        Arc::new(Self {
            channel: Channel::new(&name, DeviceKind::Consumption),
            name,
            freshness: Freshness::default(),
        })
    }

    /// Routes `topic` from the link into this meter
    pub fn attach(self: &Arc<Self>, link: &MqttLink, topic: &str) {
        let weak: Weak<Self> = Arc::downgrade(self);
        link.route(
            topic,
            Arc::new(move |(_, payload): Inbound| {
                if let Some(this) = weak.upgrade() {
                    this.feed(&payload);
                }
            }),
        );
    }

    pub fn feed(&self, payload: &[u8]) {
        let Some(watts) = decode_power(payload) else {
            debug!(device = %self.name, len = payload.len(), "ignoring consumption payload");
            return;
        };
        self.freshness.touch(Instant::now());
        if self.channel.snapshot().status != Some(DeviceStatus::On) {
            self.channel.publish_status(DeviceStatus::On);
        }
        self.channel.publish_power(watts);
    }
}

#[async_trait]
impl Driver for MqttMeter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kinds(&self) -> KindSet {
        KindSet::of(&[DeviceKind::Consumption])
    }

    fn channel(&self, kind: DeviceKind) -> Option<&Channel> {
        (kind == DeviceKind::Consumption).then_some(&self.channel)
    }

    async fn switch(&self, _kind: DeviceKind, _on: bool) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("switch"))
    }

    async fn run(&self) {
        watch_staleness(&self.name, &self.channel, &self.freshness).await
    }
}

pub struct MqttBattery {
    name: Arc<str>,
    channel: Channel,
    packs: PackChannel,
    freshness: Freshness,
}

impl MqttBattery {
    pub fn new(name: &str) -> Arc<Self> {
        let name: Arc<str> = Arc::from(name);
        Arc::new(Self {
            channel: Channel::new(&name, DeviceKind::Battery),
            name,
            packs: PackChannel::default(),
            freshness: Freshness::default(),
        })
    }

    /// Routes `{root}/bat/fwd/{name}` from the link into this battery
    pub fn attach(self: &Arc<Self>, link: &MqttLink) {
        let weak: Weak<Self> = Arc::downgrade(self);
        link.route(
            link.topics().battery_forward(&self.name),
            Arc::new(move |(_, payload): Inbound| {
                if let Some(this) = weak.upgrade() {
                    this.feed(&payload);
                }
            }),
        );
    }

    /// Accepts a forwarded pack; the sender's timestamp means nothing here
    pub fn feed(&self, payload: &[u8]) -> Option<Arc<BatteryPack>> {
        let mut pack = match BatteryPack::from_json(payload) {
            Ok(pack) => pack,
            Err(e) => {
                warn!(device = %self.name, error = %e, "ignoring forwarded pack");
                return None;
            }
        };
        pack.name = self.name.to_string();
        pack.timestamp = clock::monotonic_secs();
        pack.is_forwarded = true;
        self.freshness.touch(Instant::now());
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
impl Driver for MqttBattery {
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
        watch_staleness(&self.name, &self.channel, &self.freshness).await
    }
}

#[async_trait]
impl BatteryDriver for MqttBattery {
    /// Nothing to poll; the latest forwarded pack
    async fn read(&self) -> Option<Arc<BatteryPack>> {
        self.packs.last()
    }

    fn subscribe_packs(&self, sink: Sink<Arc<BatteryPack>>) {
        self.packs.subscribe(sink);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MqttConfig;
    use crate::domain::battery::fixtures::pack;

    fn link() -> Arc<MqttLink> {
        let config = MqttConfig {
            host: "localhost".into(),
            port: 1883,
            client_id: "bess-test".into(),
            username: None,
            password: None,
            root: "bess".into(),
            live_consumption_topic: Some("meter/grid".into()),
            offline_after_s: 120,
        };
        MqttLink::new(&config, Instant::now()).0
    }

    #[tokio::test]
    async fn test_meter_decodes_both_widths() {
        let link = link();
        let meter = MqttMeter::new("grid");
        meter.attach(&link, "meter/grid");

        link.dispatch("meter/grid", &(-350i16).to_be_bytes());
        assert_eq!(meter.snapshot(DeviceKind::Consumption).power, Some(-350));
        link.dispatch("meter/grid", &70_000i32.to_be_bytes());
        assert_eq!(meter.snapshot(DeviceKind::Consumption).power, Some(70_000));
        link.dispatch("meter/grid", &[1, 2, 3]);
        assert_eq!(meter.snapshot(DeviceKind::Consumption).power, Some(70_000));
        assert_eq!(meter.snapshot(DeviceKind::Consumption).status, Some(DeviceStatus::On));
    }

    #[tokio::test]
    async fn test_forwarded_pack_restamped() {
        let link = link();
        let battery = MqttBattery::new("garage");
        battery.attach(&link);
        let mut remote = pack("remote-name", 40.0);
        remote.timestamp = 99_999.0;

        link.dispatch("bess/bat/fwd/garage", remote.to_json().as_bytes());
        let got = battery.read().await.unwrap();
        assert_eq!(got.name, "garage");
        assert!(got.is_forwarded);
        assert!(got.timestamp < 99_999.0);
        assert_eq!(got.c, 40.0);

        link.dispatch("bess/bat/fwd/garage", b"{not json");
        assert_eq!(battery.read().await.unwrap().c, 40.0);
        link.dispatch("bess/bat/fwd/other", remote.to_json().as_bytes());
        assert_eq!(battery.snapshot(DeviceKind::Battery).status, Some(DeviceStatus::On));
    }

    #[tokio::test]
    async fn test_implausible_forward_is_fault() {
        let battery = MqttBattery::new("garage");
        let mut bad = pack("garage", 40.0);
        bad.cells[0] = 9.0;
        assert!(battery.feed(bad.to_json().as_bytes()).is_none());
        assert_eq!(battery.snapshot(DeviceKind::Battery).status, Some(DeviceStatus::Fault));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_goes_offline_once() {
        let freshness = Freshness::default();
        let start = Instant::now();
        assert!(!freshness.went_stale(start + Duration::from_secs(119), start));
        assert!(freshness.went_stale(start + STALE_AFTER, start));
        assert!(!freshness.went_stale(start + STALE_AFTER * 2, start));
        freshness.touch(start + STALE_AFTER * 2);
        assert!(freshness.went_stale(start + STALE_AFTER * 3, start));
    }
}
