//! # Driver contract
//!
//! Every device driver exposes the same capability-addressed facade:
//! a name, the set of kinds it implements, and per kind a `switch`
//! command, a measurement channel (`subscribe` / `snapshot`) and its own
//! poll loop (`run`). Battery and inverter drivers add kind-specific
//! operations through [`BatteryDriver`] and [`InverterDriver`].
//!
//! Transport failures never leave a driver: they are logged, counted, and
//! surface as `offline` / `fault` status on the driver's channels.

pub mod ble;
pub mod factory;
pub mod http;
pub mod modbus;
pub mod mqtt;
pub mod simulated;
pub mod vedirect;
pub mod watchdog;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::{BatteryPack, DeviceEvent, DeviceKind, DeviceStatus, KindSet, Measurement};

/// Default per-operation timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// BLE connection establishment
pub const BLE_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Charger confirming a switch request
pub const CHARGER_CONFIRM_TIMEOUT: Duration = Duration::from_secs(30);
/// Inverter confirming a restart after being switched on
pub const INVERTER_RESET_TIMEOUT: Duration = Duration::from_secs(60);

/// Driver-level errors. None of them escape a driver's poll loop.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("device reported fault: {0}")]
    Fault(String),
    #[error("radio busy with another device")]
    Busy,
    #[error("{0} not supported by this device")]
    Unsupported(&'static str),
    #[error("device does not implement {0}")]
    WrongKind(DeviceKind),
}

impl From<std::io::Error> for DriverError {
    fn from(e: std::io::Error) -> Self {
        DriverError::Transport(e.to_string())
    }
}

impl From<reqwest::Error> for DriverError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            DriverError::Protocol(e.to_string())
        } else {
            DriverError::Transport(e.to_string())
        }
    }
}

/// Run `fut` with a wall-clock limit; expiry is a failed operation.
pub async fn with_timeout<T, F>(op: &'static str, limit: Duration, fut: F) -> Result<T, DriverError>
where
    F: Future<Output = Result<T, DriverError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(DriverError::Timeout { op, after: limit }),
    }
}

// ============================================================================
// Sinks
// ============================================================================

/// Subscriber callback. Must not block; heavy work goes through a command queue.
pub type Sink<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Subscriber list owned by the publisher
pub struct SinkList<T> {
    sinks: Mutex<Vec<Sink<T>>>,
}

impl<T> Default for SinkList<T> {
    fn default() -> Self {
        Self {
            sinks: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> SinkList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, sink: Sink<T>) {
        self.sinks.lock().push(sink);
    }

    /// Deliver to every subscriber registered before this call.
    /// Subscriptions added during delivery see the next value.
    pub fn emit(&self, value: T) {
        let sinks: Vec<Sink<T>> = self.sinks.lock().clone();
        for sink in sinks {
            sink(value.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.sinks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Channels
// ============================================================================

/// Last known measurements of one kind of one device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub status: Option<DeviceStatus>,
    pub power: Option<i32>,
    pub energy: Option<u32>,
}

/// Measurement stream for one kind of one device
pub struct Channel {
    device: Arc<str>,
    kind: DeviceKind,
    last: Mutex<ChannelSnapshot>,
    sinks: SinkList<DeviceEvent>,
}

impl Channel {
    pub fn new(device: &Arc<str>, kind: DeviceKind) -> Self {
        Self {
            device: device.clone(),
            kind,
            last: Mutex::new(ChannelSnapshot::default()),
            sinks: SinkList::new(),
        }
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn subscribe(&self, sink: Sink<DeviceEvent>) {
        self.sinks.subscribe(sink);
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        *self.last.lock()
    }

    pub fn publish(&self, measurement: Measurement) {
        {
            let mut last = self.last.lock();
            match measurement {
                Measurement::Status(s) => last.status = Some(s),
                Measurement::Power(p) => last.power = Some(p),
                Measurement::Energy(e) => last.energy = Some(e),
            }
        }
        self.sinks.emit(DeviceEvent {
            device: self.device.clone(),
            kind: self.kind,
            measurement,
        });
    }

    pub fn publish_status(&self, status: DeviceStatus) {
        self.publish(Measurement::Status(status));
    }

    pub fn publish_power(&self, watts: i32) {
        self.publish(Measurement::Power(watts));
    }

    pub fn publish_energy(&self, wh: u32) {
        self.publish(Measurement::Energy(wh));
    }
}

/// Validating publisher for battery pack snapshots
#[derive(Default)]
pub struct PackChannel {
    sinks: SinkList<Arc<BatteryPack>>,
    last: Mutex<Option<Arc<BatteryPack>>>,
}

impl PackChannel {
    pub fn subscribe(&self, sink: Sink<Arc<BatteryPack>>) {
        self.sinks.subscribe(sink);
    }

    pub fn last(&self) -> Option<Arc<BatteryPack>> {
        self.last.lock().clone()
    }

    /// Publishes the snapshot if it validates; implausible snapshots are dropped here.
    pub fn publish(&self, pack: BatteryPack) -> Option<Arc<BatteryPack>> {
        if let Err(e) = pack.validate() {
            warn!(device = %pack.name, error = %e, "dropping implausible battery snapshot");
            return None;
        }
        let pack = Arc::new(pack);
        *self.last.lock() = Some(pack.clone());
        self.sinks.emit(pack.clone());
        Some(pack)
    }
}

/// Turns consecutive transport failures into an `offline` transition
pub struct FailureCounter {
    threshold: u32,
    count: AtomicU32,
}

impl FailureCounter {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            count: AtomicU32::new(0),
        }
    }

    pub fn success(&self) {
        self.count.store(0, Ordering::Relaxed);
    }

    /// Records a failure; returns true once the threshold is reached
    pub fn failure(&self) -> bool {
        let count = self.count.fetch_add(1, Ordering::Relaxed).saturating_add(1);
        count >= self.threshold
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Driver traits
// ============================================================================

#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &str;

    fn kinds(&self) -> KindSet;

    /// Measurement channel for `kind`, `None` if the driver does not implement it
    fn channel(&self, kind: DeviceKind) -> Option<&Channel>;

    async fn switch(&self, kind: DeviceKind, on: bool) -> Result<(), DriverError>;

    /// Cooperative poll loop; runs until the process exits
    async fn run(&self);

    fn subscribe(&self, kind: DeviceKind, sink: Sink<DeviceEvent>) {
        match self.channel(kind) {
            Some(channel) => channel.subscribe(sink),
            None => debug!(device = self.name(), %kind, "subscription for unsupported kind ignored"),
        }
    }

    fn snapshot(&self, kind: DeviceKind) -> ChannelSnapshot {
        self.channel(kind).map(Channel::snapshot).unwrap_or_default()
    }
}

#[async_trait]
pub trait BatteryDriver: Driver {
    /// One full poll; publishes and returns the snapshot if it validates
    async fn read(&self) -> Option<Arc<BatteryPack>>;

    fn subscribe_packs(&self, sink: Sink<Arc<BatteryPack>>);
}

#[async_trait]
pub trait InverterDriver: Driver {
    /// Requests `watts`; returns the setpoint actually applied after quantisation
    async fn set_power(&self, watts: u32) -> Result<u32, DriverError>;

    fn min_power(&self) -> u32;

    fn max_power(&self) -> u32;
}

// ============================================================================
// Fleet
// ============================================================================

/// All drivers, registered per kind at startup
#[derive(Default, Clone)]
pub struct Fleet {
    pub batteries: Vec<Arc<dyn BatteryDriver>>,
    pub inverters: Vec<Arc<dyn InverterDriver>>,
    by_kind: BTreeMap<DeviceKind, Vec<Arc<dyn Driver>>>,
    all: Vec<Arc<dyn Driver>>,
}

impl Fleet {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&mut self, driver: Arc<dyn Driver>) {
        for kind in driver.kinds().iter() {
            self.by_kind.entry(kind).or_default().push(driver.clone());
        }
        self.all.push(driver);
    }

    /// Registers a driver that only offers the generic contract
    pub fn add<D: Driver + 'static>(&mut self, driver: Arc<D>) {
        self.register(driver);
    }

    pub fn add_battery<D: BatteryDriver + 'static>(&mut self, driver: Arc<D>) {
        self.batteries.push(driver.clone());
        self.register(driver);
    }

    pub fn add_inverter<D: InverterDriver + 'static>(&mut self, driver: Arc<D>) {
        self.inverters.push(driver.clone());
        self.register(driver);
    }

    pub fn of_kind(&self, kind: DeviceKind) -> Vec<Arc<dyn Driver>> {
        self.by_kind.get(&kind).cloned().unwrap_or_default()
    }

    pub fn all(&self) -> &[Arc<dyn Driver>] {
        &self.all
    }

    pub fn has(&self, kind: DeviceKind) -> bool {
        self.by_kind.get(&kind).is_some_and(|v| !v.is_empty())
    }

    /// Spawns every driver's poll loop
    pub fn spawn(&self) {
        for driver in &self.all {
            let driver = driver.clone();
            tokio::spawn(async move {
                driver.run().await;
                warn!(device = driver.name(), "driver poll loop ended");
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_list_snapshot_before_iterating() {
        let list: Arc<SinkList<u32>> = Arc::new(SinkList::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let inner_list = list.clone();
        let inner_seen = seen.clone();
        list.subscribe(Arc::new(move |v: u32| {
            inner_seen.lock().push(("first", v));
            let late_seen = inner_seen.clone();
            inner_list.subscribe(Arc::new(move |v: u32| late_seen.lock().push(("late", v))));
        }));

        list.emit(1);
        assert_eq!(*seen.lock(), vec![("first", 1)]);
        list.emit(2);
        assert_eq!(&seen.lock()[1..3], &[("first", 2), ("late", 2)]);
    }

    #[test]
    fn test_channel_snapshot_tracks_last_values() {
        let name: Arc<str> = Arc::from("dev");
        let channel = Channel::new(&name, DeviceKind::Charger);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = events.clone();
        channel.subscribe(Arc::new(move |e: DeviceEvent| sink_events.lock().push(e.measurement)));

        channel.publish_status(DeviceStatus::On);
        channel.publish_power(420);
        channel.publish_energy(35);

        let snap = channel.snapshot();
        assert_eq!(snap.status, Some(DeviceStatus::On));
        assert_eq!(snap.power, Some(420));
        assert_eq!(snap.energy, Some(35));
        assert_eq!(events.lock().len(), 3);
    }

    #[test]
    fn test_pack_channel_drops_invalid() {
        let channel = PackChannel::default();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        channel.subscribe(Arc::new(move |_: Arc<BatteryPack>| {
            c.fetch_add(1, Ordering::Relaxed);
        }));

        let mut bad = crate::domain::battery::fixtures::pack("a", 10.0);
        bad.timestamp = 0.0;
        assert!(channel.publish(bad).is_none());
        assert!(channel.publish(crate::domain::battery::fixtures::pack("a", 10.0)).is_some());
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_failure_counter() {
        let counter = FailureCounter::new(3);
        assert!(!counter.failure());
        assert!(!counter.failure());
        assert!(counter.failure());
        counter.success();
        assert_eq!(counter.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_expires() {
        let result: Result<(), DriverError> = with_timeout("handshake", Duration::from_secs(5), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(DriverError::Timeout { op: "handshake", .. })));
    }
}
