//! End-to-end behaviour of the controller pieces wired the way the binary wires them.

mod common;

use bess_controller::config::NetZeroConfig;
use bess_controller::controller::netzero::NetZero;
use bess_controller::controller::{
    BatteryCoordinator, CellLimitChecker, Controller, ModeSwitcher, MqttOfflineChecker, OutputRouter, Outputs,
    StartupChecker, Supervisor,
};
use bess_controller::domain::{BatteryPack, DeviceKind, KindSet, LockReason, Mode};
use bess_controller::hardware::simulated::SimulatedBattery;
use bess_controller::hardware::watchdog::NullWatchdog;
use bess_controller::hardware::{BatteryDriver, Fleet};
use bess_controller::io::{LogIndicators, MemoryPublisher, Topics};
use common::{config, pack, FakeLink, FakePacks, Recorder, RecordingDisplay};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn router(publisher: &Arc<MemoryPublisher>, display: &Arc<RecordingDisplay>) -> Arc<OutputRouter> {
    OutputRouter::new(
        Topics::new("bess"),
        publisher.clone(),
        display.clone(),
        Arc::new(LogIndicators),
    )
}

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

#[tokio::test]
async fn test_cell_high_stops_charging_once() {
    let t0 = Instant::now();
    let packs = Arc::new(FakePacks::default());
    *packs.extremes.lock() = Some((3.30, 3.40));

    let supervisor = Arc::new(Supervisor::new(secs(5), Arc::new(NullWatchdog::new()), t0));
    supervisor.register(Box::new(StartupChecker::new(secs(60))));
    supervisor.register(Box::new(CellLimitChecker::high(packs.clone(), 3.55, 0.05)));

    let calls = Arc::new(Mutex::new(Vec::new()));
    let switcher = Arc::new(ModeSwitcher::new(
        Recorder::new(DeviceKind::Charger, calls.clone()),
        Recorder::new(DeviceKind::Solar, calls.clone()),
        Recorder::new(DeviceKind::Inverter, calls.clone()),
    ));
    let publisher = Arc::new(MemoryPublisher::new());
    let display = Arc::new(RecordingDisplay::default());
    let router = router(&publisher, &display);
    {
        let router = router.clone();
        supervisor.subscribe_top(Arc::new(move |top: Option<LockReason>| router.on_lock(top)));
        let switcher = switcher.clone();
        supervisor.subscribe_blocked(Arc::new(move |blocked: KindSet| switcher.update_locks(blocked)));
    }

    supervisor.check_once(t0);
    switcher.request(Mode::Charge);
    assert_eq!(switcher.effective(), Mode::Idle);

    for k in 1..=13 {
        supervisor.check_once(t0 + secs(5 * k));
    }
    switcher.queue().drain().await;
    assert_eq!(switcher.effective(), Mode::Charge);
    calls.lock().clear();

    *packs.extremes.lock() = Some((3.30, 3.60));
    supervisor.check_once(t0 + secs(70));
    switcher.queue().drain().await;
    router.queue().drain().await;

    let calls = calls.lock().clone();
    let charger: Vec<Mode> = calls
        .iter()
        .filter(|(k, _)| *k == DeviceKind::Charger)
        .map(|(_, m)| *m)
        .collect();
    assert_eq!(charger, vec![Mode::Idle]);
    assert!(calls.iter().all(|(k, _)| *k != DeviceKind::Inverter));
    assert!(calls.contains(&(DeviceKind::Solar, Mode::Protect)));
    assert_eq!(switcher.effective(), Mode::Idle);
    assert_eq!(publisher.last("bess/locked"), Some(b"cell_high".to_vec()));
    assert_eq!(display.locks.lock().last().map(String::as_str), Some("cell_high"));
}

fn netzero() -> NetZero {
    NetZero::new(NetZeroConfig {
        enabled: true,
        power_offset: 50,
        power_hysteresis: 20,
        power_change_upwards: 100,
        power_change_downwards: 150,
        evaluated_time_span_s: 60,
        maturity_time_span_s: 30,
    })
}

#[test]
fn test_netzero_steps_up_on_steady_import() {
    let t0 = Instant::now();
    let mut nz = netzero();
    for k in 0..10 {
        nz.add(t0 + secs(4 * k), 200);
    }
    assert_eq!(nz.evaluate(t0 + secs(40)), 100);
}

#[test]
fn test_netzero_pulls_back_on_export() {
    let t0 = Instant::now();
    let mut nz = netzero();
    for (k, watts) in [200, -50, 180, -10, 190].into_iter().enumerate() {
        nz.add(t0 + secs(k as u64), watts);
    }
    assert_eq!(nz.evaluate(t0 + secs(5)), -150);
}

#[tokio::test]
async fn test_pack_capacity_is_summed_and_published() {
    let a = Arc::new(SimulatedBattery::new("A"));
    let b = Arc::new(SimulatedBattery::new("B"));
    let drivers: Vec<Arc<dyn BatteryDriver>> = vec![a.clone(), b.clone()];
    let batteries = BatteryCoordinator::new(drivers);
    batteries.attach();

    let publisher = Arc::new(MemoryPublisher::new());
    let display = Arc::new(RecordingDisplay::default());
    let router = router(&publisher, &display);
    {
        let router = router.clone();
        batteries.subscribe(Arc::new(move |pack: Arc<BatteryPack>| router.on_pack(&pack)));
    }

    assert!(a.push(pack("A", 50.0)).is_some());
    assert!(b.push(pack("B", 30.0)).is_some());
    router.queue().drain().await;

    assert_eq!(batteries.total_capacity(), 80.0);
    assert_eq!(display.capacity.lock().last().copied(), Some(80.0));
    assert_eq!(publisher.last("bess/bat/dev/A/c"), Some(vec![0x01, 0xF4]));
    assert_eq!(publisher.last("bess/bat/dev/B/c"), Some(vec![0x01, 0x2C]));
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_starves_after_broker_outage() {
    let t0 = Instant::now();
    let link = Arc::new(FakeLink::default());
    *link.down_since.lock() = Some(t0);
    let watchdog = Arc::new(NullWatchdog::new());

    let supervisor = Arc::new(Supervisor::new(secs(1), watchdog.clone(), t0));
    supervisor.register(Box::new(MqttOfflineChecker::new(link, secs(1))));
    {
        let checks = supervisor.clone();
        tokio::spawn(async move { checks.run_checks().await });
        let feeder = supervisor.clone();
        tokio::spawn(async move { feeder.run_watchdog().await });
    }

    tokio::time::sleep(Duration::from_millis(2_200)).await;
    let fed = watchdog.feeds();
    assert!(fed > 0);
    assert!(supervisor.locks().contains("mqtt_offline"));

    tokio::time::sleep(Duration::from_millis(3_010)).await;
    assert_eq!(watchdog.feeds(), fed);
}

#[tokio::test]
async fn test_startup_lock_released_after_quiet_minute() {
    let t0 = Instant::now();
    let publisher = Arc::new(MemoryPublisher::new());
    let controller = Controller::new(
        &config(""),
        Fleet::new(),
        Outputs {
            topics: Topics::new("bess"),
            publisher: publisher.clone(),
            display: Arc::new(RecordingDisplay::default()),
            indicators: Arc::new(LogIndicators),
            watchdog: Arc::new(NullWatchdog::new()),
            link: Arc::new(FakeLink::default()),
        },
    );

    let names: Vec<&str> = controller.supervisor.locks().iter().map(|r| r.name).collect();
    assert_eq!(names, vec!["startup"]);

    for k in 0..=14 {
        controller.supervisor.check_once(t0 + secs(5 * k));
    }
    controller.router.queue().drain().await;

    assert_eq!(
        publisher.on_topic("bess/locked"),
        vec![b"startup".to_vec(), Vec::new()]
    );
    assert!(controller.supervisor.locks().is_empty());
}
