//! Hoymiles micro-inverters behind an AhoyDTU or OpenDTU gateway.
//!
//! Both gateways take an absolute, non-persistent power limit in watts and
//! report AC power and the day's yield. Every request is retried with a
//! one second back-off before the poll counts as failed.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{check_status, client, with_retries, BACKOFF};
use crate::hardware::{Channel, Driver, DriverError, FailureCounter, InverterDriver};
use crate::domain::{DeviceKind, DeviceStatus, KindSet};

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const OFFLINE_AFTER: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Live {
    status: DeviceStatus,
    watts: f64,
    yield_day_wh: f64,
}

/// State shared by both gateway flavours
struct DtuCore {
    name: Arc<str>,
    base: String,
    http: reqwest::Client,
    backoff: Duration,
    min_power: u32,
    max_power: u32,
    channel: Channel,
    failures: FailureCounter,
    last_yield_wh: Mutex<Option<f64>>,
}

impl DtuCore {
    fn new(name: &str, url: &str, min_power: u32, max_power: u32) -> Result<Self, DriverError> {
        let name: Arc<str> = Arc::from(name);
        Ok(Self {
            channel: Channel::new(&name, DeviceKind::Inverter),
            name,
            base: url.trim_end_matches('/').to_string(),
            http: client()?,
            backoff: BACKOFF,
            min_power,
            max_power: max_power.max(min_power),
            failures: FailureCounter::new(OFFLINE_AFTER),
            last_yield_wh: Mutex::new(None),
        })
    }

    fn clamp(&self, watts: u32) -> u32 {
        watts.clamp(self.min_power, self.max_power)
    }

    fn publish(&self, live: Live) {
        self.channel.publish_status(live.status);
        self.channel.publish_power(live.watts.round() as i32);
        let previous = self.last_yield_wh.lock().replace(live.yield_day_wh);
        if let Some(previous) = previous {
            // the day counter restarts overnight
            let delta = if live.yield_day_wh >= previous {
                live.yield_day_wh - previous
            } else {
                live.yield_day_wh
            };
            self.channel.publish_energy(delta.round() as u32);
        }
    }

    fn poll_failed(&self, e: &DriverError) {
        warn!(device = %self.name, error = %e, failures = self.failures.count() + 1, "poll failed");
        if self.failures.failure() {
            self.channel.publish_status(DeviceStatus::Offline);
        }
    }
}

// ============================================================================
// AhoyDTU
// ============================================================================

#[derive(Debug, Deserialize)]
struct AhoyInverter {
    #[serde(default)]
    is_avail: bool,
    #[serde(default)]
    is_producing: bool,
    /// Per channel field values; channel 0 is the AC side
    #[serde(default)]
    ch: Vec<Vec<f64>>,
}

/// Field positions of the AC channel
const AHOY_P_AC: usize = 2;
const AHOY_YIELD_DAY: usize = 7;

#[derive(Debug, Deserialize)]
struct AhoyReply {
    #[serde(default)]
    success: bool,
}

pub struct Ahoy {
    core: DtuCore,
    inverter_id: u32,
}

impl Ahoy {
    pub fn new(name: &str, url: &str, inverter_id: u32, min_power: u32, max_power: u32) -> Result<Self, DriverError> {
        Ok(Self {
            core: DtuCore::new(name, url, min_power, max_power)?,
            inverter_id,
        })
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.core.backoff = backoff;
        self
    }

    async fn live(&self) -> Result<Live, DriverError> {
        let url = format!("{}/api/inverter/id/{}", self.core.base, self.inverter_id);
        let (http, url) = (&self.core.http, url.as_str());
        let inverter: AhoyInverter = with_retries("ahoy live", self.core.backoff, move || async move {
            let response = check_status(http.get(url).send().await?)?;
            Ok::<_, DriverError>(response.json::<AhoyInverter>().await?)
        })
        .await?;
        let ac = inverter.ch.first().map(Vec::as_slice).unwrap_or(&[]);
        let status = match (inverter.is_avail, inverter.is_producing) {
            (false, _) => DeviceStatus::Offline,
            (true, true) => DeviceStatus::On,
            (true, false) => DeviceStatus::Off,
        };
        Ok(Live {
            status,
            watts: ac.get(AHOY_P_AC).copied().unwrap_or(0.0),
            yield_day_wh: ac.get(AHOY_YIELD_DAY).copied().unwrap_or(0.0),
        })
    }

    async fn control(&self, cmd: &'static str, val: u32) -> Result<(), DriverError> {
        let url = format!("{}/api/ctrl", self.core.base);
        let body = json!({ "id": self.inverter_id, "cmd": cmd, "val": val });
        let (http, url, body) = (&self.core.http, url.as_str(), &body);
        let reply: AhoyReply = with_retries("ahoy control", self.core.backoff, move || async move {
            let response = check_status(http.post(url).json(body).send().await?)?;
            Ok::<_, DriverError>(response.json::<AhoyReply>().await?)
        })
        .await?;
        if reply.success {
            Ok(())
        } else {
            Err(DriverError::Fault(format!("ahoy rejected {cmd}")))
        }
    }
}

#[async_trait]
impl Driver for Ahoy {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn kinds(&self) -> KindSet {
        KindSet::of(&[DeviceKind::Inverter])
    }

    fn channel(&self, kind: DeviceKind) -> Option<&Channel> {
        (kind == DeviceKind::Inverter).then_some(&self.core.channel)
    }

    async fn switch(&self, kind: DeviceKind, on: bool) -> Result<(), DriverError> {
        if kind != DeviceKind::Inverter {
            return Err(DriverError::WrongKind(kind));
        }
        self.control("power", u32::from(on)).await?;
        info!(device = %self.core.name, on, "inverter switched");
        Ok(())
    }

    async fn run(&self) {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            ticker.tick().await;
            match self.live().await {
                Ok(live) => {
                    self.core.failures.success();
                    self.core.publish(live);
                }
                Err(e) => self.core.poll_failed(&e),
            }
        }
    }
}

#[async_trait]
impl InverterDriver for Ahoy {
    async fn set_power(&self, watts: u32) -> Result<u32, DriverError> {
        let applied = self.core.clamp(watts);
        self.control("limit_nonpersistent_absolute", applied).await?;
        debug!(device = %self.core.name, applied, "power limit sent");
        Ok(applied)
    }

    fn min_power(&self) -> u32 {
        self.core.min_power
    }

    fn max_power(&self) -> u32 {
        self.core.max_power
    }
}

// ============================================================================
// OpenDTU
// ============================================================================

#[derive(Debug, Deserialize)]
struct Value {
    v: f64,
}

#[derive(Debug, Deserialize)]
struct OpenDtuInverter {
    serial: String,
    #[serde(default)]
    reachable: bool,
    #[serde(default)]
    producing: bool,
    #[serde(rename = "AC", default)]
    ac: HashMap<String, HashMap<String, Value>>,
    #[serde(rename = "INV", default)]
    inv: HashMap<String, HashMap<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct OpenDtuStatus {
    #[serde(default)]
    inverters: Vec<OpenDtuInverter>,
}

#[derive(Debug, Deserialize)]
struct OpenDtuReply {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: String,
}

fn field(map: &HashMap<String, HashMap<String, Value>>, name: &str) -> f64 {
    map.get("0").and_then(|f| f.get(name)).map(|v| v.v).unwrap_or(0.0)
}

pub struct OpenDtu {
    core: DtuCore,
    serial: String,
    credentials: Option<(String, String)>,
}

impl OpenDtu {
    pub fn new(
        name: &str,
        url: &str,
        serial: &str,
        min_power: u32,
        max_power: u32,
        credentials: Option<(String, String)>,
    ) -> Result<Self, DriverError> {
        Ok(Self {
            core: DtuCore::new(name, url, min_power, max_power)?,
            serial: serial.to_string(),
            credentials,
        })
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.core.backoff = backoff;
        self
    }

    async fn live(&self) -> Result<Live, DriverError> {
        let url = format!("{}/api/livedata/status?inv={}", self.core.base, self.serial);
        let (http, url) = (&self.core.http, url.as_str());
        let status: OpenDtuStatus = with_retries("opendtu live", self.core.backoff, move || async move {
            let response = check_status(http.get(url).send().await?)?;
            Ok::<_, DriverError>(response.json::<OpenDtuStatus>().await?)
        })
        .await?;
        let inverter = status
            .inverters
            .into_iter()
            .find(|i| i.serial == self.serial)
            .ok_or_else(|| DriverError::Protocol(format!("inverter {} not listed", self.serial)))?;
        let state = match (inverter.reachable, inverter.producing) {
            (false, _) => DeviceStatus::Offline,
            (true, true) => DeviceStatus::On,
            (true, false) => DeviceStatus::Off,
        };
        Ok(Live {
            status: state,
            watts: field(&inverter.ac, "Power"),
            yield_day_wh: field(&inverter.inv, "YieldDay"),
        })
    }

    async fn configure(&self, path: &'static str, data: serde_json::Value) -> Result<(), DriverError> {
        let url = format!("{}{}", self.core.base, path);
        let form = [("data", data.to_string())];
        let (http, url, form, credentials) = (&self.core.http, url.as_str(), &form, &self.credentials);
        let reply: OpenDtuReply = with_retries("opendtu config", self.core.backoff, move || async move {
            let mut request = http.post(url).form(form);
            if let Some((user, pass)) = credentials {
                request = request.basic_auth(user, Some(pass));
            }
            let response = check_status(request.send().await?)?;
            Ok::<_, DriverError>(response.json::<OpenDtuReply>().await?)
        })
        .await?;
        if reply.kind == "success" {
            Ok(())
        } else {
            Err(DriverError::Fault(format!("opendtu {path}: {}", reply.message)))
        }
    }
}

#[async_trait]
impl Driver for OpenDtu {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn kinds(&self) -> KindSet {
        KindSet::of(&[DeviceKind::Inverter])
    }

    fn channel(&self, kind: DeviceKind) -> Option<&Channel> {
        (kind == DeviceKind::Inverter).then_some(&self.core.channel)
    }

    async fn switch(&self, kind: DeviceKind, on: bool) -> Result<(), DriverError> {
        if kind != DeviceKind::Inverter {
            return Err(DriverError::WrongKind(kind));
        }
        self.configure("/api/power/config", json!({ "serial": self.serial, "power": on }))
            .await?;
        info!(device = %self.core.name, on, "inverter switched");
        Ok(())
    }

    async fn run(&self) {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            ticker.tick().await;
            match self.live().await {
                Ok(live) => {
                    self.core.failures.success();
                    self.core.publish(live);
                }
                Err(e) => self.core.poll_failed(&e),
            }
        }
    }
}

#[async_trait]
impl InverterDriver for OpenDtu {
    async fn set_power(&self, watts: u32) -> Result<u32, DriverError> {
        let applied = self.core.clamp(watts);
        // limit_type 0: absolute, non-persistent
        self.configure(
            "/api/limit/config",
            json!({ "serial": self.serial, "limit_type": 0, "limit_value": applied }),
        )
        .await?;
        debug!(device = %self.core.name, applied, "power limit sent");
        Ok(applied)
    }

    fn min_power(&self) -> u32 {
        self.core.min_power
    }

    fn max_power(&self) -> u32 {
        self.core.max_power
    }
}
