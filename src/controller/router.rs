//! # Output router
//!
//! Pure fan-out of class events, pack snapshots, lock and mode changes to
//! MQTT, the display and the indicators. Every send goes through the
//! router's FIFO; a failed send is logged and the next one proceeds.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::coordinator::ClassEvent;
use super::queue::CommandQueue;
use crate::domain::{BatteryPack, DeviceKind, DeviceStatus, LockReason, Mode};
use crate::io::{payload, Display, Indicators, Publisher, Qos, Topics};

const SWITCHED: [DeviceKind; 3] = [DeviceKind::Charger, DeviceKind::Inverter, DeviceKind::Solar];

#[derive(Debug, Default)]
struct Published {
    capacities: BTreeMap<String, f32>,
    statuses: BTreeMap<DeviceKind, DeviceStatus>,
    mode: Option<Mode>,
    lock: Option<String>,
}

pub struct OutputRouter {
    topics: Topics,
    publisher: Arc<dyn Publisher>,
    display: Arc<dyn Display>,
    indicators: Arc<dyn Indicators>,
    queue: CommandQueue,
    published: Mutex<Published>,
}

impl OutputRouter {
    pub fn new(
        topics: Topics,
        publisher: Arc<dyn Publisher>,
        display: Arc<dyn Display>,
        indicators: Arc<dyn Indicators>,
    ) -> Arc<Self> {
        Arc::new(Self {
            topics,
            publisher,
            display,
            indicators,
            queue: CommandQueue::new("router"),
            published: Mutex::new(Published::default()),
        })
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    fn send(&self, topic: String, payload: Vec<u8>) {
        let publisher = self.publisher.clone();
        self.queue.append(topic.clone(), move || async move {
            if let Err(e) = publisher.publish(topic, payload, Qos::AtLeastOnce).await {
                warn!(error = %e, "publish failed");
            }
        });
    }

    fn show<F>(&self, identity: &'static str, f: F)
    where
        F: FnOnce(&dyn Display) + Send + 'static,
    {
        let display = self.display.clone();
        self.queue.append(identity, move || async move { f(display.as_ref()) });
    }

    fn indicate(&self, kind: DeviceKind, on: bool) {
        let indicators = self.indicators.clone();
        self.queue
            .append(format!("indicator/{kind}"), move || async move { indicators.set(kind, on) });
    }

    /// Valid snapshots update the capacity display; own packs are published per point
    pub fn on_pack(&self, pack: &BatteryPack) {
        if !pack.is_valid() {
            return;
        }
        let total = {
            let mut published = self.published.lock();
            published.capacities.insert(pack.name.clone(), pack.c);
            published.capacities.values().sum::<f32>()
        };
        self.show("display/capacity", move |d| d.show_capacity(total));

        if pack.is_forwarded {
            debug!(device = %pack.name, "forwarded pack not republished");
            return;
        }
        // one job per snapshot, keyed by pack
        let messages: Vec<(String, Vec<u8>)> = payload::pack_points(pack)
            .into_iter()
            .map(|(point, bytes)| (self.topics.battery(&pack.name, &point), bytes))
            .collect();
        let publisher = self.publisher.clone();
        self.queue.append(format!("pack/{}", pack.name), move || async move {
            for (topic, bytes) in messages {
                if let Err(e) = publisher.publish(topic, bytes, Qos::AtLeastOnce).await {
                    warn!(error = %e, "publish failed");
                }
            }
        });
    }

    pub fn total_capacity(&self) -> f32 {
        self.published.lock().capacities.values().sum()
    }

    pub fn on_class_event(&self, event: ClassEvent) {
        match event {
            ClassEvent::Status { kind, status } if SWITCHED.contains(&kind) => {
                self.published.lock().statuses.insert(kind, status);
                self.indicate(kind, status.is_on());
                self.send(self.topics.state(kind), payload::state(status));
            }
            ClassEvent::Power {
                kind: DeviceKind::Inverter,
                watts,
            } => {
                self.show("display/power", move |d| d.show_power(watts));
                self.send(self.topics.power(DeviceKind::Inverter), payload::u16_be(watts as i64));
            }
            ClassEvent::Energy { kind, wh } if SWITCHED.contains(&kind) => {
                self.send(self.topics.energy(kind), payload::u16_be(wh as i64));
            }
            ClassEvent::Summary { kind, status, watts } if SWITCHED.contains(&kind) => {
                self.published.lock().statuses.insert(kind, status);
                self.send(self.topics.state(kind), payload::state(status));
                if kind == DeviceKind::Inverter {
                    self.send(self.topics.power(kind), payload::u16_be(watts as i64));
                }
            }
            _ => {}
        }
    }

    pub fn on_lock(&self, top: Option<LockReason>) {
        let name = top.map(|r| r.name.to_string()).unwrap_or_default();
        self.published.lock().lock = Some(name.clone());
        let shown = name.clone();
        self.show("display/lock", move |d| d.show_lock(&shown));
        self.send(self.topics.locked(), name.into_bytes());
    }

    pub fn on_mode(&self, mode: Mode) {
        self.published.lock().mode = Some(mode);
        self.show("display/mode", move |d| d.show_mode(mode));
        self.send(self.topics.mode_actual(), mode.to_string().into_bytes());
    }

    /// Republishes class statuses, the mode and the top lock after a reconnect
    pub fn on_reconnect(&self) {
        let (statuses, mode, lock) = {
            let published = self.published.lock();
            (published.statuses.clone(), published.mode, published.lock.clone())
        };
        for (kind, status) in statuses {
            self.send(self.topics.state(kind), payload::state(status));
        }
        if let Some(mode) = mode {
            self.send(self.topics.mode_actual(), mode.to_string().into_bytes());
        }
        if let Some(lock) = lock {
            self.send(self.topics.locked(), lock.into_bytes());
        }
    }

    pub fn spawn(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move { this.queue.run().await });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::checkers::cell_high_reason;
    use crate::domain::battery::fixtures::pack;
    use crate::io::display::{MockDisplay, MockIndicators};
    use crate::io::{IoError, LogDisplay, LogIndicators, MemoryPublisher, MockPublisher};
    use mockall::predicate::eq;

    fn router(publisher: Arc<dyn Publisher>) -> Arc<OutputRouter> {
        OutputRouter::new(
            Topics::new("bess"),
            publisher,
            Arc::new(LogDisplay),
            Arc::new(LogIndicators),
        )
    }

    #[tokio::test]
    async fn test_pack_points_and_forwarded_skip() {
        let publisher = Arc::new(MemoryPublisher::new());
        let router = router(publisher.clone());
        router.on_pack(&pack("A", 50.0));
        let mut forwarded = pack("B", 30.0);
        forwarded.is_forwarded = true;
        router.on_pack(&forwarded);
        router.queue().drain().await;

        assert_eq!(publisher.last("bess/bat/dev/A/c"), Some(vec![0x01, 0xF4]));
        assert!(publisher.messages().iter().all(|(t, _)| !t.contains("/B/")));
        assert_eq!(router.total_capacity(), 80.0);
    }

    #[tokio::test]
    async fn test_status_drives_indicator_and_state() {
        let mut indicators = MockIndicators::new();
        indicators
            .expect_set()
            .with(eq(DeviceKind::Charger), eq(true))
            .times(1)
            .returning(|_, _| ());
        let publisher = Arc::new(MemoryPublisher::new());
        let router = OutputRouter::new(
            Topics::new("bess"),
            publisher.clone(),
            Arc::new(LogDisplay),
            Arc::new(indicators),
        );
        router.on_class_event(ClassEvent::Status {
            kind: DeviceKind::Charger,
            status: DeviceStatus::On,
        });
        router.on_class_event(ClassEvent::Status {
            kind: DeviceKind::Consumption,
            status: DeviceStatus::On,
        });
        router.on_class_event(ClassEvent::Energy {
            kind: DeviceKind::Solar,
            wh: 123,
        });
        router.queue().drain().await;
        assert_eq!(
            publisher.messages(),
            vec![
                ("bess/cha/state".to_string(), vec![1]),
                ("bess/sol/e".to_string(), vec![0, 123]),
            ]
        );
    }

    #[tokio::test]
    async fn test_lock_to_display_and_topic() {
        let mut display = MockDisplay::new();
        display.expect_show_lock().with(eq("cell_high")).times(1).returning(|_| ());
        display.expect_show_lock().with(eq("")).times(1).returning(|_| ());
        let publisher = Arc::new(MemoryPublisher::new());
        let router = OutputRouter::new(
            Topics::new("bess"),
            publisher.clone(),
            Arc::new(display),
            Arc::new(LogIndicators),
        );
        router.on_lock(Some(cell_high_reason()));
        router.on_lock(None);
        router.queue().drain().await;
        assert_eq!(publisher.on_topic("bess/locked"), vec![b"cell_high".to_vec(), Vec::new()]);
    }

    #[tokio::test]
    async fn test_failed_send_does_not_stop_the_next() {
        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish()
            .withf(|topic, _, _| topic == "bess/mode/actual")
            .times(1)
            .returning(|_, _, _| Err(IoError::NotConnected));
        publisher
            .expect_publish()
            .withf(|topic, _, _| topic == "bess/inv/p")
            .times(1)
            .returning(|_, _, _| Ok(()));
        let router = router(Arc::new(publisher));
        router.on_mode(Mode::Charge);
        router.on_class_event(ClassEvent::Power {
            kind: DeviceKind::Inverter,
            watts: 300,
        });
        router.queue().drain().await;
    }

    #[tokio::test]
    async fn test_reconnect_republishes() {
        let publisher = Arc::new(MemoryPublisher::new());
        let router = router(publisher.clone());
        router.on_class_event(ClassEvent::Summary {
            kind: DeviceKind::Inverter,
            status: DeviceStatus::On,
            watts: 250,
        });
        router.on_mode(Mode::Discharge);
        router.queue().drain().await;
        publisher.clear();

        router.on_reconnect();
        router.queue().drain().await;
        assert_eq!(publisher.last("bess/inv/state"), Some(vec![1]));
        assert_eq!(publisher.last("bess/mode/actual"), Some(b"discharge".to_vec()));
    }
}
