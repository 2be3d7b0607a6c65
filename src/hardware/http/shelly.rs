//! Shelly relay (Gen1 API) switching a charger, a heater or the solar path.
//!
//! Every `turn=on` carries a 300 s auto-off timer, so a controller that
//! dies cannot leave the relay closed. While on, the relay is re-armed
//! every 120 s regardless of what it reports.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{check_status, client, with_retries, BACKOFF};
use crate::domain::{DeviceKind, DeviceStatus, KindSet};
use crate::hardware::{Channel, Driver, DriverError, FailureCounter};

/// Relay auto-off timer sent with every `turn=on`
pub const AUTO_OFF: Duration = Duration::from_secs(300);
/// Re-arm period while switched on
pub const REFRESH: Duration = Duration::from_secs(120);

const POLL_INTERVAL: Duration = Duration::from_secs(10);
const OFFLINE_AFTER: u32 = 3;

#[derive(Debug, Deserialize)]
struct Relay {
    ison: bool,
}

#[derive(Debug, Deserialize)]
struct Meter {
    #[serde(default)]
    power: f64,
    /// Watt-minutes since boot
    #[serde(default)]
    total: Option<u64>,
}

#[derive(Debug, Default)]
struct Armed {
    wanted: bool,
    at: Option<Instant>,
}

pub struct Shelly {
    name: Arc<str>,
    kind: DeviceKind,
    base: String,
    http: reqwest::Client,
    backoff: Duration,
    channel: Channel,
    failures: FailureCounter,
    armed: Mutex<Armed>,
    last_total: Mutex<Option<u64>>,
}

impl Shelly {
    pub fn new(name: &str, url: &str, kind: DeviceKind) -> Result<Self, DriverError> {
        let name: Arc<str> = Arc::from(name);
        Ok(Self {
            channel: Channel::new(&name, kind),
            name,
            kind,
            base: url.trim_end_matches('/').to_string(),
            http: client()?,
            backoff: BACKOFF,
            failures: FailureCounter::new(OFFLINE_AFTER),
            armed: Mutex::new(Armed::default()),
            last_total: Mutex::new(None),
        })
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    async fn relay(&self, query: &str) -> Result<Relay, DriverError> {
        let url = format!("{}/relay/0{}", self.base, query);
        let (http, url) = (&self.http, url.as_str());
        with_retries("shelly relay", self.backoff, move || async move {
            let response = check_status(http.get(url).send().await?)?;
            Ok::<_, DriverError>(response.json::<Relay>().await?)
        })
        .await
    }

    async fn turn(&self, on: bool) -> Result<Relay, DriverError> {
        let query = if on {
            format!("?turn=on&timer={}", AUTO_OFF.as_secs())
        } else {
            "?turn=off".to_string()
        };
        let relay = self.relay(&query).await?;
        self.armed.lock().at = on.then(Instant::now);
        Ok(relay)
    }

    fn needs_rearm(&self, now: Instant) -> bool {
        let armed = self.armed.lock();
        armed.wanted && armed.at.map_or(true, |at| now.saturating_duration_since(at) >= REFRESH)
    }

    async fn poll(&self) -> Result<(), DriverError> {
        let relay = if self.needs_rearm(Instant::now()) {
            debug!(device = %self.name, "re-arming relay timer");
            self.turn(true).await?
        } else {
            self.relay("").await?
        };
        self.channel
            .publish_status(if relay.ison { DeviceStatus::On } else { DeviceStatus::Off });

        let url = format!("{}/meter/0", self.base);
        let (http, url) = (&self.http, url.as_str());
        let meter = with_retries("shelly meter", self.backoff, move || async move {
            let response = check_status(http.get(url).send().await?)?;
            Ok::<_, DriverError>(response.json::<Meter>().await?)
        })
        .await?;
        self.channel.publish_power(meter.power.round() as i32);
        if let Some(total) = meter.total {
            let previous = self.last_total.lock().replace(total);
            if let Some(previous) = previous {
                // counter restarts with the device
                let delta = total.checked_sub(previous).unwrap_or(total);
                self.channel.publish_energy((delta / 60) as u32);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Driver for Shelly {
    fn name(&self) -> &str {
        &self.name
    }

    fn kinds(&self) -> KindSet {
        KindSet::of(&[self.kind])
    }

    fn channel(&self, kind: DeviceKind) -> Option<&Channel> {
        (kind == self.kind).then_some(&self.channel)
    }

    async fn switch(&self, kind: DeviceKind, on: bool) -> Result<(), DriverError> {
        if kind != self.kind {
            return Err(DriverError::WrongKind(kind));
        }
        self.armed.lock().wanted = on;
        let relay = self.turn(on).await?;
        info!(device = %self.name, %kind, on, "relay switched");
        self.channel
            .publish_status(if relay.ison { DeviceStatus::On } else { DeviceStatus::Off });
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
