//! # Device class coordinator
//!
//! One coordinator per [`DeviceKind`]. It merges the status and power of all
//! member drivers into a class-level view, accounts energy per 300 s window
//! and serialises `switch` commands to its members.
//!
//! Member measurements are handed to the class FIFO as they arrive, so
//! status and power deltas leave the coordinator in arrival order.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::aggregator::ValueAggregator;
use super::queue::CommandQueue;
use super::trigger::Trigger;
use crate::domain::{DeviceEvent, DeviceKind, DeviceStatus, Measurement, Mode};
use crate::hardware::{Driver, Sink, SinkList};

/// Class-level event fanned out to the supervisor, router and net-zero loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassEvent {
    Status { kind: DeviceKind, status: DeviceStatus },
    Power { kind: DeviceKind, watts: i32 },
    /// Wh over the 300 s window just closed
    Energy { kind: DeviceKind, wh: u32 },
    /// Periodic heartbeat, sent regardless of change
    Summary {
        kind: DeviceKind,
        status: DeviceStatus,
        watts: i32,
    },
}

impl ClassEvent {
    pub fn kind(&self) -> DeviceKind {
        match self {
            ClassEvent::Status { kind, .. }
            | ClassEvent::Power { kind, .. }
            | ClassEvent::Energy { kind, .. }
            | ClassEvent::Summary { kind, .. } => *kind,
        }
    }
}

/// Merges member statuses into the class status.
///
/// `None` marks a member that has not reported yet. If no member has
/// reported the class is `offline`; an empty class is `off`. Otherwise
/// unreported members count as `offline` and: any `fault` gives `fault`,
/// all `on` gives `on`, all `off` gives `off`, anything else `syncing`.
pub fn merge_status<I>(members: I) -> DeviceStatus
where
    I: IntoIterator<Item = Option<DeviceStatus>>,
{
    let statuses: Vec<Option<DeviceStatus>> = members.into_iter().collect();
    if statuses.is_empty() {
        return DeviceStatus::Off;
    }
    if statuses.iter().all(Option::is_none) {
        return DeviceStatus::Offline;
    }
    let resolved = statuses.iter().map(|s| s.unwrap_or(DeviceStatus::Offline));
    let mut any_fault = false;
    let mut all_on = true;
    let mut all_off = true;
    for status in resolved {
        any_fault |= status == DeviceStatus::Fault;
        all_on &= status == DeviceStatus::On;
        all_off &= status == DeviceStatus::Off;
    }
    if any_fault {
        DeviceStatus::Fault
    } else if all_on {
        DeviceStatus::On
    } else if all_off {
        DeviceStatus::Off
    } else {
        DeviceStatus::Syncing
    }
}

/// Desired on/off state of a class for a mode; `None` for classes not driven by mode
pub fn wants_on(kind: DeviceKind, mode: Mode) -> Option<bool> {
    match kind {
        DeviceKind::Charger => Some(mode == Mode::Charge),
        DeviceKind::Inverter => Some(mode == Mode::Discharge),
        DeviceKind::Solar => Some(mode != Mode::Protect),
        _ => None,
    }
}

/// Receiver of mode commands from the mode switcher
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModeTarget: Send + Sync {
    async fn set_mode(&self, mode: Mode);
}

#[derive(Debug, Default)]
struct Member {
    status: Option<DeviceStatus>,
    power: Option<i32>,
    aggregator: ValueAggregator,
    /// Energy the device reported itself during the current window
    reported_wh: Option<u32>,
}

#[derive(Debug)]
struct ClassState {
    members: Vec<Member>,
    status: DeviceStatus,
    power: i32,
    commanded: Option<bool>,
}

pub struct ClassCoordinator {
    kind: DeviceKind,
    drivers: Vec<Arc<dyn Driver>>,
    state: Mutex<ClassState>,
    switch_lock: tokio::sync::Mutex<()>,
    queue: CommandQueue,
    events: SinkList<ClassEvent>,
    weak: Weak<ClassCoordinator>,
}

impl ClassCoordinator {
    pub fn new(kind: DeviceKind, drivers: Vec<Arc<dyn Driver>>) -> Arc<Self> {
        let members = drivers.iter().map(|_| Member::default()).collect::<Vec<_>>();
        let status = merge_status(members.iter().map(|m| m.status));
        Arc::new_cyclic(|weak| Self {
            kind,
            drivers,
            state: Mutex::new(ClassState {
                members,
                status,
                power: 0,
                commanded: None,
            }),
            switch_lock: tokio::sync::Mutex::new(()),
            queue: CommandQueue::new(kind_queue_name(kind)),
            events: SinkList::new(),
            weak: weak.clone(),
        })
    }

    /// Registers member sinks. Sinks hold a weak reference back to the coordinator.
    pub fn attach(&self) {
        for (index, driver) in self.drivers.iter().enumerate() {
            let weak = self.weak.clone();
            driver.subscribe(
                self.kind,
                Arc::new(move |event: DeviceEvent| {
                    if let Some(this) = weak.upgrade() {
                        this.enqueue_event(index, event);
                    }
                }),
            );
        }
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn drivers(&self) -> &[Arc<dyn Driver>] {
        &self.drivers
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    pub fn status(&self) -> DeviceStatus {
        self.state.lock().status
    }

    pub fn power(&self) -> i32 {
        self.state.lock().power
    }

    pub fn commanded(&self) -> Option<bool> {
        self.state.lock().commanded
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn subscribe(&self, sink: Sink<ClassEvent>) {
        self.events.subscribe(sink);
    }

    fn enqueue_event(&self, index: usize, event: DeviceEvent) {
        let identity = match event.measurement {
            Measurement::Status(_) => format!("{}/status", event.device),
            Measurement::Power(_) => format!("{}/power", event.device),
            Measurement::Energy(_) => format!("{}/energy", event.device),
        };
        let weak = self.weak.clone();
        self.queue.append(identity, move || async move {
            if let Some(this) = weak.upgrade() {
                this.handle(index, event.measurement, Instant::now());
            }
        });
    }

    /// Applies one member measurement and emits class deltas
    pub fn handle(&self, index: usize, measurement: Measurement, now: Instant) {
        let emitted = {
            let mut state = self.state.lock();
            let Some(member) = state.members.get_mut(index) else {
                return;
            };
            match measurement {
                Measurement::Status(status) => {
                    member.status = Some(status);
                    let merged = merge_status(state.members.iter().map(|m| m.status));
                    if merged != state.status {
                        debug!(kind = %self.kind, from = %state.status, to = %merged, "class status changed");
                        state.status = merged;
                        Some(ClassEvent::Status {
                            kind: self.kind,
                            status: merged,
                        })
                    } else {
                        None
                    }
                }
                Measurement::Power(watts) => {
                    member.power = Some(watts);
                    member.aggregator.add_at(watts as f64, now);
                    let total: i32 = state.members.iter().filter_map(|m| m.power).sum();
                    if total != state.power {
                        state.power = total;
                        Some(ClassEvent::Power {
                            kind: self.kind,
                            watts: total,
                        })
                    } else {
                        None
                    }
                }
                Measurement::Energy(wh) => {
                    member.reported_wh = Some(member.reported_wh.unwrap_or(0).saturating_add(wh));
                    None
                }
            }
        };
        if let Some(event) = emitted {
            self.events.emit(event);
        }
    }

    /// Publishes `watts` as the class power without a member report
    pub fn force_power(&self, watts: i32) {
        let changed = {
            let mut state = self.state.lock();
            let changed = state.power != watts;
            state.power = watts;
            changed
        };
        if changed {
            self.events.emit(ClassEvent::Power {
                kind: self.kind,
                watts,
            });
        }
    }

    /// Closes the energy window: device-reported Wh where available, else the power integral
    pub fn close_window(&self, now: Instant) -> u32 {
        let mut state = self.state.lock();
        let mut total: u64 = 0;
        for member in state.members.iter_mut() {
            member.aggregator.flush_at(now);
            let wh = match member.reported_wh.take() {
                Some(wh) => wh as u64,
                None => member.aggregator.integral_wh().max(0.0).round() as u64,
            };
            total += wh;
            match member.power {
                Some(p) => member.aggregator.restart_at(p as f64, now),
                None => member.aggregator.clear(),
            }
        }
        total.min(u32::MAX as u64) as u32
    }

    /// Trigger subscriber: heartbeat summary, energy and re-command on mismatch
    pub fn on_trigger(&self, trigger: Trigger) -> anyhow::Result<()> {
        if trigger != Trigger::Every300s || self.drivers.is_empty() {
            return Ok(());
        }
        let wh = self.close_window(Instant::now());
        let (status, watts, commanded) = {
            let state = self.state.lock();
            (state.status, state.power, state.commanded)
        };
        self.events.emit(ClassEvent::Energy { kind: self.kind, wh });
        self.events.emit(ClassEvent::Summary {
            kind: self.kind,
            status,
            watts,
        });

        let mismatch = match commanded {
            Some(true) => status == DeviceStatus::Off,
            Some(false) => status == DeviceStatus::On,
            None => false,
        };
        if let (true, Some(on)) = (mismatch, commanded) {
            info!(kind = %self.kind, %status, on, "class disagrees with command, re-commanding");
            let weak = self.weak.clone();
            self.queue.append("recommand", move || async move {
                if let Some(this) = weak.upgrade() {
                    this.command(on, true).await;
                }
            });
        }
        Ok(())
    }

    /// Switches every member; skipped when `on` equals the last command unless `force`
    pub async fn command(&self, on: bool, force: bool) {
        let _guard = self.switch_lock.lock().await;
        {
            let state = self.state.lock();
            if !force && state.commanded == Some(on) {
                debug!(kind = %self.kind, on, "class already commanded");
                return;
            }
        }
        self.state.lock().commanded = Some(on);
        for driver in &self.drivers {
            match driver.switch(self.kind, on).await {
                Ok(()) => debug!(device = driver.name(), kind = %self.kind, on, "switched"),
                Err(e) => warn!(device = driver.name(), kind = %self.kind, on, error = %e, "switch failed"),
            }
        }
    }

    /// Spawns the class FIFO worker
    pub fn spawn(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move { this.queue.run().await });
    }
}

#[async_trait]
impl ModeTarget for ClassCoordinator {
    async fn set_mode(&self, mode: Mode) {
        match wants_on(self.kind, mode) {
            Some(on) => self.command(on, false).await,
            None => debug!(kind = %self.kind, %mode, "class not driven by mode"),
        }
    }
}

fn kind_queue_name(kind: DeviceKind) -> &'static str {
    match kind {
        DeviceKind::Battery => "battery",
        DeviceKind::Charger => "charger",
        DeviceKind::Inverter => "inverter",
        DeviceKind::Solar => "solar",
        DeviceKind::Heater => "heater",
        DeviceKind::Consumption => "consumption",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::simulated::SimulatedDevice;
    use crate::domain::KindSet;
    use proptest::prelude::*;
    use rstest::rstest;
    use std::time::Duration;

    fn class_of(n: usize, kind: DeviceKind) -> (Arc<ClassCoordinator>, Vec<Arc<SimulatedDevice>>) {
        let devices: Vec<Arc<SimulatedDevice>> = (0..n)
            .map(|i| Arc::new(SimulatedDevice::new(&format!("dev{i}"), KindSet::of(&[kind]))))
            .collect();
        let drivers = devices.iter().map(|d| d.clone() as Arc<dyn Driver>).collect();
        let class = ClassCoordinator::new(kind, drivers);
        class.attach();
        (class, devices)
    }

    fn recorder(class: &ClassCoordinator) -> Arc<Mutex<Vec<ClassEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        class.subscribe(Arc::new(move |e: ClassEvent| sink.lock().push(e)));
        events
    }

    #[rstest]
    #[case(vec![], DeviceStatus::Off)]
    #[case(vec![None, None], DeviceStatus::Offline)]
    #[case(vec![Some(DeviceStatus::On), None], DeviceStatus::Syncing)]
    #[case(vec![Some(DeviceStatus::On), Some(DeviceStatus::On)], DeviceStatus::On)]
    #[case(vec![Some(DeviceStatus::Off), Some(DeviceStatus::Off)], DeviceStatus::Off)]
    #[case(vec![Some(DeviceStatus::On), Some(DeviceStatus::Off)], DeviceStatus::Syncing)]
    #[case(vec![Some(DeviceStatus::Fault), Some(DeviceStatus::On)], DeviceStatus::Fault)]
    #[case(vec![Some(DeviceStatus::Offline), Some(DeviceStatus::Fault), None], DeviceStatus::Fault)]
    fn test_merge_status(#[case] members: Vec<Option<DeviceStatus>>, #[case] expected: DeviceStatus) {
        assert_eq!(merge_status(members), expected);
    }

    fn any_status() -> impl Strategy<Value = DeviceStatus> {
        prop_oneof![
            Just(DeviceStatus::Off),
            Just(DeviceStatus::On),
            Just(DeviceStatus::Syncing),
            Just(DeviceStatus::Fault),
            Just(DeviceStatus::Offline),
        ]
    }

    proptest! {
        #[test]
        fn prop_merge_matches_rule(statuses in proptest::collection::vec(any_status(), 1..8)) {
            let merged = merge_status(statuses.iter().copied().map(Some));
            let any_fault = statuses.contains(&DeviceStatus::Fault);
            let all_on = statuses.iter().all(|s| *s == DeviceStatus::On);
            let all_off = statuses.iter().all(|s| *s == DeviceStatus::Off);
            prop_assert_eq!(merged == DeviceStatus::Fault, any_fault);
            prop_assert_eq!(merged == DeviceStatus::On, all_on);
            prop_assert_eq!(merged == DeviceStatus::Off, all_off);
            if !any_fault && !all_on && !all_off {
                prop_assert_eq!(merged, DeviceStatus::Syncing);
            }
        }
    }

    #[test]
    fn test_wants_on() {
        assert_eq!(wants_on(DeviceKind::Charger, Mode::Charge), Some(true));
        assert_eq!(wants_on(DeviceKind::Charger, Mode::Discharge), Some(false));
        assert_eq!(wants_on(DeviceKind::Inverter, Mode::Discharge), Some(true));
        assert_eq!(wants_on(DeviceKind::Solar, Mode::Idle), Some(true));
        assert_eq!(wants_on(DeviceKind::Solar, Mode::Protect), Some(false));
        assert_eq!(wants_on(DeviceKind::Heater, Mode::Charge), None);
    }

    #[tokio::test]
    async fn test_status_and_power_deltas_in_arrival_order() {
        let (class, devices) = class_of(2, DeviceKind::Charger);
        let events = recorder(&class);
        assert_eq!(class.status(), DeviceStatus::Offline);

        devices[0].report_status(DeviceKind::Charger, DeviceStatus::On);
        devices[0].report_power(DeviceKind::Charger, 300);
        devices[1].report_status(DeviceKind::Charger, DeviceStatus::On);
        devices[1].report_power(DeviceKind::Charger, 200);
        devices[1].report_power(DeviceKind::Charger, 200);
        class.queue().drain().await;

        assert_eq!(
            *events.lock(),
            vec![
                ClassEvent::Status { kind: DeviceKind::Charger, status: DeviceStatus::Syncing },
                ClassEvent::Power { kind: DeviceKind::Charger, watts: 300 },
                ClassEvent::Status { kind: DeviceKind::Charger, status: DeviceStatus::On },
                ClassEvent::Power { kind: DeviceKind::Charger, watts: 500 },
            ]
        );
    }

    #[tokio::test]
    async fn test_command_skips_unchanged() {
        let (class, devices) = class_of(2, DeviceKind::Inverter);
        class.set_mode(Mode::Discharge).await;
        class.set_mode(Mode::Discharge).await;
        class.set_mode(Mode::Idle).await;
        for device in &devices {
            assert_eq!(device.switch_log(), vec![(DeviceKind::Inverter, true), (DeviceKind::Inverter, false)]);
        }
        assert_eq!(class.commanded(), Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_energy_prefers_reported() {
        let (class, _devices) = class_of(2, DeviceKind::Solar);
        let t0 = Instant::now();
        class.handle(0, Measurement::Power(600), t0);
        class.handle(1, Measurement::Power(1200), t0);
        class.handle(1, Measurement::Energy(40), t0 + Duration::from_secs(100));
        class.handle(1, Measurement::Energy(50), t0 + Duration::from_secs(200));
        // member 0: 600 W for 300 s = 50 Wh, member 1 reported 90 Wh
        assert_eq!(class.close_window(t0 + Duration::from_secs(300)), 140);
        // window restarted at current power
        assert_eq!(class.close_window(t0 + Duration::from_secs(600)), 150);
    }

    #[tokio::test(start_paused = true)]
    async fn test_summary_and_recommand() {
        let (class, devices) = class_of(1, DeviceKind::Charger);
        let events = recorder(&class);
        class.set_mode(Mode::Charge).await;
        devices[0].report_status(DeviceKind::Charger, DeviceStatus::Off);
        class.queue().drain().await;

        class.on_trigger(Trigger::Every6s).unwrap();
        assert!(events.lock().iter().all(|e| !matches!(e, ClassEvent::Summary { .. })));

        class.on_trigger(Trigger::Every300s).unwrap();
        assert!(events.lock().contains(&ClassEvent::Summary {
            kind: DeviceKind::Charger,
            status: DeviceStatus::Off,
            watts: 0
        }));
        class.queue().drain().await;
        assert_eq!(
            devices[0].switch_log(),
            vec![(DeviceKind::Charger, true), (DeviceKind::Charger, true)]
        );
    }

    #[tokio::test]
    async fn test_force_power_emits_once() {
        let (class, _devices) = class_of(1, DeviceKind::Inverter);
        let events = recorder(&class);
        class.handle(0, Measurement::Power(250), Instant::now());
        class.force_power(0);
        class.force_power(0);
        assert_eq!(
            *events.lock(),
            vec![
                ClassEvent::Power { kind: DeviceKind::Inverter, watts: 250 },
                ClassEvent::Power { kind: DeviceKind::Inverter, watts: 0 },
            ]
        );
    }
}
