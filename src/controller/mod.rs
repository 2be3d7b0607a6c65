//! # Controller
//!
//! Builds the coordinators on top of a driver [`Fleet`] and wires them
//! together through sinks: drivers feed class coordinators, coordinators
//! feed the router, the supervisor feeds the mode switcher, and the
//! trigger bus paces everything periodic.

pub mod aggregator;
pub mod battery;
pub mod checkers;
pub mod consumption;
pub mod coordinator;
pub mod heater;
pub mod inverter;
pub mod mode;
pub mod netzero;
pub mod queue;
pub mod router;
pub mod supervisor;
pub mod trigger;

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

use crate::config::Config;
use crate::domain::{BatteryPack, DeviceKind, KindSet, LockReason, Mode};
use crate::hardware::watchdog::Watchdog;
use crate::hardware::Fleet;
use crate::io::{Display, Indicators, Publisher, Topics};

pub use battery::BatteryCoordinator;
pub use checkers::{
    BatteryOfflineChecker, CellLimitChecker, LinkStatus, LiveDataChecker, MqttOfflineChecker, StartupChecker,
};
pub use consumption::ConsumptionCoordinator;
pub use coordinator::{ClassCoordinator, ClassEvent, ModeTarget};
pub use heater::HeaterCoordinator;
pub use inverter::InverterCoordinator;
pub use mode::ModeSwitcher;
pub use router::OutputRouter;
pub use supervisor::Supervisor;
pub use trigger::{Trigger, TriggerBus};

/// Where the controller's state goes, and what it watches besides the fleet
pub struct Outputs {
    pub topics: Topics,
    pub publisher: Arc<dyn Publisher>,
    pub display: Arc<dyn Display>,
    pub indicators: Arc<dyn Indicators>,
    pub watchdog: Arc<dyn Watchdog>,
    pub link: Arc<dyn LinkStatus>,
}

pub struct Controller {
    pub fleet: Fleet,
    pub charger: Arc<ClassCoordinator>,
    pub solar: Arc<ClassCoordinator>,
    pub heater: Arc<HeaterCoordinator>,
    pub inverter: Arc<InverterCoordinator>,
    pub batteries: Arc<BatteryCoordinator>,
    pub consumption: Arc<ConsumptionCoordinator>,
    pub switcher: Arc<ModeSwitcher>,
    pub supervisor: Arc<Supervisor>,
    pub router: Arc<OutputRouter>,
    pub triggers: Arc<TriggerBus>,
}

fn class(fleet: &Fleet, kind: DeviceKind) -> Arc<ClassCoordinator> {
    let coordinator = ClassCoordinator::new(kind, fleet.of_kind(kind));
    coordinator.attach();
    coordinator
}

impl Controller {
    pub fn new(cfg: &Config, fleet: Fleet, outputs: Outputs) -> Arc<Self> {
        let now = Instant::now();

        let charger = class(&fleet, DeviceKind::Charger);
        let solar = class(&fleet, DeviceKind::Solar);
        let inverter_class = class(&fleet, DeviceKind::Inverter);
        let heater = HeaterCoordinator::new(class(&fleet, DeviceKind::Heater), cfg.heater.clone());
        let inverter = InverterCoordinator::new(
            inverter_class.clone(),
            fleet.inverters.clone(),
            &cfg.inverter,
            cfg.netzero.clone(),
        );
        inverter.attach();
        let batteries = BatteryCoordinator::new(fleet.batteries.clone());
        batteries.attach();
        let consumption = ConsumptionCoordinator::new(fleet.of_kind(DeviceKind::Consumption));
        consumption.attach();

        let router = OutputRouter::new(outputs.topics, outputs.publisher, outputs.display, outputs.indicators);
        let switcher = Arc::new(ModeSwitcher::new(
            charger.clone(),
            solar.clone(),
            inverter_class.clone(),
        ));
        let supervisor = Arc::new(Supervisor::new(cfg.supervisor.check_interval(), outputs.watchdog, now));

        // class events -> router
        for coordinator in [&charger, &solar, &inverter_class, heater.class()] {
            let router = router.clone();
            coordinator.subscribe(Arc::new(move |event: ClassEvent| router.on_class_event(event)));
        }

        // packs -> heater, router
        {
            let heater = heater.clone();
            let router = router.clone();
            let heating = !heater.class().is_empty();
            batteries.subscribe(Arc::new(move |pack: Arc<BatteryPack>| {
                if heating {
                    heater.on_pack(&pack);
                }
                router.on_pack(&pack);
            }));
        }

        // live consumption -> net-zero
        {
            let inverter = inverter.clone();
            consumption.subscribe(Arc::new(move |watts: i32| inverter.on_live_consumption(watts)));
        }

        // supervisor -> router, switcher
        {
            let router = router.clone();
            supervisor.subscribe_top(Arc::new(move |top: Option<LockReason>| router.on_lock(top)));
            let switcher = switcher.clone();
            supervisor.subscribe_blocked(Arc::new(move |blocked: KindSet| switcher.update_locks(blocked)));
        }

        // effective mode -> router
        {
            let router = router.clone();
            switcher.subscribe(Arc::new(move |mode: Mode| router.on_mode(mode)));
        }

        register_checkers(cfg, &supervisor, outputs.link, &batteries, &consumption, now);

        let triggers = Arc::new(TriggerBus::new());
        for (name, coordinator) in [
            ("charger", &charger),
            ("solar", &solar),
            ("inverter", &inverter_class),
            ("heater", heater.class()),
        ] {
            let coordinator = coordinator.clone();
            triggers.subscribe(name, Arc::new(move |t: Trigger| coordinator.on_trigger(t)));
        }
        {
            let inverter = inverter.clone();
            triggers.subscribe("netzero", Arc::new(move |t: Trigger| inverter.on_trigger(t)));
            let switcher = switcher.clone();
            triggers.subscribe("mode", Arc::new(move |t: Trigger| switcher.on_trigger(t)));
        }

        info!(
            devices = fleet.all().len(),
            batteries = fleet.batteries.len(),
            inverters = fleet.inverters.len(),
            "controller assembled"
        );

        Arc::new(Self {
            fleet,
            charger,
            solar,
            heater,
            inverter,
            batteries,
            consumption,
            switcher,
            supervisor,
            router,
            triggers,
        })
    }

    /// Operator request, as parsed from `{root}/mode/set`
    pub fn request_mode(&self, mode: Mode) {
        self.switcher.request(mode);
    }

    /// Republishes retained state after the broker link came back
    pub fn on_reconnect(&self) {
        self.router.on_reconnect();
    }

    /// Stops feeding, and disarms, the hardware watchdog
    pub fn shutdown(&self) {
        self.supervisor.disarm();
    }
}

fn register_checkers(
    cfg: &Config,
    supervisor: &Supervisor,
    link: Arc<dyn LinkStatus>,
    batteries: &Arc<BatteryCoordinator>,
    consumption: &Arc<ConsumptionCoordinator>,
    now: Instant,
) {
    let sup = &cfg.supervisor;
    supervisor.register(Box::new(StartupChecker::new(Duration::from_secs(sup.startup_quiet_s))));
    supervisor.register(Box::new(MqttOfflineChecker::new(
        link,
        Duration::from_secs(cfg.mqtt.offline_after_s),
    )));
    if !consumption.is_empty() {
        supervisor.register(Box::new(LiveDataChecker::discharge(
            consumption.clone(),
            Duration::from_secs(sup.live_data_lost_discharge_s),
            now,
        )));
        supervisor.register(Box::new(LiveDataChecker::charge(
            consumption.clone(),
            Duration::from_secs(sup.live_data_lost_charge_s),
            now,
        )));
    }
    if !batteries.is_empty() {
        supervisor.register(Box::new(BatteryOfflineChecker::new(
            batteries.clone(),
            Duration::from_secs(sup.battery_offline_s),
        )));
        supervisor.register(Box::new(CellLimitChecker::high(
            batteries.clone(),
            sup.cell_high_v,
            sup.cell_hysteresis_v,
        )));
        supervisor.register(Box::new(CellLimitChecker::low(
            batteries.clone(),
            sup.cell_low_v,
            sup.cell_hysteresis_v,
        )));
    }
}

/// Spawns every long-lived controller task: driver polls, FIFO workers,
/// supervision, watchdog feeding and the trigger bus.
pub fn spawn_controller_tasks(controller: &Arc<Controller>) {
    controller.fleet.spawn();
    for coordinator in [
        &controller.charger,
        &controller.solar,
        controller.inverter.class(),
        controller.heater.class(),
    ] {
        coordinator.spawn();
    }
    controller.switcher.spawn();
    controller.router.spawn();

    let supervisor = controller.supervisor.clone();
    tokio::spawn(async move { supervisor.run_checks().await });
    let supervisor = controller.supervisor.clone();
    tokio::spawn(async move { supervisor.run_watchdog().await });
    let triggers = controller.triggers.clone();
    tokio::spawn(async move { triggers.run().await });
}
