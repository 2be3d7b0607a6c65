use anyhow::{Context, Result};
use bess_controller::config::Config;
use bess_controller::controller::{self, Controller, Outputs};
use bess_controller::domain::Mode;
use bess_controller::hardware::factory::{DeviceFactory, Environment};
use bess_controller::hardware::watchdog::{DeviceWatchdog, NullWatchdog, Watchdog};
use bess_controller::io::mqtt::MqttLink;
use bess_controller::io::{LogDisplay, LogIndicators};
use bess_controller::telemetry::{self, init_tracing};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("ignoring .env: {e}");
        }
    }
    init_tracing();

    let cfg = Config::load().context("configuration")?;

    let watchdog: Arc<dyn Watchdog> = match &cfg.watchdog.device {
        Some(path) => Arc::new(
            DeviceWatchdog::open(path).with_context(|| format!("opening watchdog {}", path.display()))?,
        ),
        None => {
            warn!("no hardware watchdog configured");
            Arc::new(NullWatchdog::new())
        }
    };

    let (link, eventloop) = MqttLink::new(&cfg.mqtt, Instant::now());
    let fleet = DeviceFactory::new(Environment {
        link: Some(link.clone()),
        ..Environment::default()
    })
    .build(&cfg)
    .context("building devices")?;

    let controller = Controller::new(
        &cfg,
        fleet,
        Outputs {
            topics: link.topics().clone(),
            publisher: link.clone(),
            display: Arc::new(LogDisplay),
            indicators: Arc::new(LogIndicators),
            watchdog,
            link: link.clone(),
        },
    );

    {
        let modes = controller.clone();
        link.subscribe_modes(Arc::new(move |mode: Mode| modes.request_mode(mode)));
        let reconnects = controller.clone();
        link.subscribe_reconnects(Arc::new(move |_: ()| reconnects.on_reconnect()));
    }

    let cancel = CancellationToken::new();
    telemetry::cancel_on_signal(cancel.clone());

    info!(broker = %cfg.mqtt.host, root = %cfg.mqtt.root, "starting bess controller");
    controller::spawn_controller_tasks(&controller);

    link.clone().run(eventloop, cancel).await;

    controller.shutdown();
    warn!("shutdown complete");
    Ok(())
}
