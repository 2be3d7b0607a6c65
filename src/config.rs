use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use validator::Validate;

use crate::domain::{DeviceKind, LutError, LutPoint, PowerLut};

/// Config file used when `BESS_CONFIG` is not set
pub const DEFAULT_PATH: &str = "config/default.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Validation(#[from] validator::ValidationErrors),
    #[error("heater thresholds need hysteresis: activate {activate}°C must be below deactivate {deactivate}°C")]
    HeaterThresholds { activate: f32, deactivate: f32 },
    #[error("net-zero: {0}")]
    NetZero(String),
    #[error("device {device} references unknown serial port {port}")]
    UnknownSerialPort { device: String, port: String },
    #[error("duplicate device name {0}")]
    DuplicateDevice(String),
    #[error("duplicate serial port name {0}")]
    DuplicatePort(String),
    #[error("device {device}: power table invalid: {source}")]
    Lut {
        device: String,
        #[source]
        source: LutError,
    },
    #[error("device {0}: no BLE backend available")]
    BleUnavailable(String),
    #[error("device {device}: {reason}")]
    Device { device: String, reason: String },
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Config {
    #[validate(nested)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    #[validate(nested)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub inverter: InverterConfig,
    #[serde(default)]
    #[validate(nested)]
    pub netzero: NetZeroConfig,
    #[serde(default)]
    pub heater: HeaterConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    #[validate(nested)]
    pub serial: Vec<SerialPortConfig>,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct MqttConfig {
    #[validate(length(min = 1))]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Topic root, `{root}/mode/set` etc.
    #[validate(length(min = 1))]
    pub root: String,
    /// Grid consumption topic fed to the net-zero controller
    pub live_consumption_topic: Option<String>,
    /// Broker disconnected for longer than this raises `mqtt_offline`
    #[serde(default = "default_mqtt_offline_s")]
    #[validate(range(min = 1))]
    pub offline_after_s: u64,
}

fn default_mqtt_port() -> u16 {
    1883
}
fn default_client_id() -> String {
    "bess-controller".into()
}
fn default_mqtt_offline_s() -> u64 {
    120
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct SupervisorConfig {
    #[validate(range(min = 100, max = 60000))]
    pub check_interval_ms: u64,
    pub startup_quiet_s: u64,
    pub live_data_lost_discharge_s: u64,
    pub live_data_lost_charge_s: u64,
    pub battery_offline_s: u64,
    #[validate(range(min = 2.0, max = 5.0))]
    pub cell_high_v: f32,
    #[validate(range(min = 1.0, max = 4.5))]
    pub cell_low_v: f32,
    #[validate(range(min = 0.0, max = 0.5))]
    pub cell_hysteresis_v: f32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 5_000,
            startup_quiet_s: 60,
            live_data_lost_discharge_s: 60,
            live_data_lost_charge_s: 300,
            battery_offline_s: 300,
            cell_high_v: 3.55,
            cell_low_v: 2.9,
            cell_hysteresis_v: 0.05,
        }
    }
}

impl SupervisorConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InverterConfig {
    /// Setpoint applied on entering `on`, and permanently when net-zero is off
    pub default_power: u32,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct NetZeroConfig {
    pub enabled: bool,
    /// Target residual import (W); negative exports
    pub power_offset: i32,
    pub power_hysteresis: u32,
    #[validate(range(min = 1))]
    pub power_change_upwards: u32,
    #[validate(range(min = 1))]
    pub power_change_downwards: u32,
    #[validate(range(min = 5, max = 3600))]
    pub evaluated_time_span_s: u64,
    pub maturity_time_span_s: u64,
}

impl Default for NetZeroConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            power_offset: 30,
            power_hysteresis: 20,
            power_change_upwards: 100,
            power_change_downwards: 150,
            evaluated_time_span_s: 60,
            maturity_time_span_s: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeaterConfig {
    pub activate_c: f32,
    pub deactivate_c: f32,
}

impl Default for HeaterConfig {
    fn default() -> Self {
        Self {
            activate_c: 5.0,
            deactivate_c: 10.0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Watchdog character device, e.g. `/dev/watchdog`. Unset on bench setups.
    pub device: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SerialPortConfig {
    pub name: String,
    pub path: String,
    #[serde(default = "default_baud")]
    #[validate(range(min = 1200, max = 115200))]
    pub baud: u32,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default = "default_stop_bits")]
    #[validate(range(min = 1, max = 2))]
    pub stop_bits: u8,
}

fn default_baud() -> u32 {
    9600
}
fn default_stop_bits() -> u8 {
    1
}

/// One configured device; `type` selects the driver
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceConfig {
    Growatt {
        name: String,
        port: String,
        slave: u8,
        max_power: u32,
        #[serde(default = "default_min_percent")]
        min_percent: u8,
        /// Measured percent -> watts table; linear from `max_power` when absent
        #[serde(default)]
        lut: Option<Vec<LutPoint>>,
        /// Reserved, currently without effect
        #[serde(default)]
        power_hysteresis: u32,
    },
    Heidelberg {
        name: String,
        port: String,
        slave: u8,
        /// Charging current applied when switched on (0.1 A)
        #[serde(default = "default_max_current")]
        max_current_da: u16,
    },
    Ahoy {
        name: String,
        url: String,
        #[serde(default)]
        inverter_id: u32,
        max_power: u32,
        #[serde(default)]
        min_power: u32,
    },
    Opendtu {
        name: String,
        url: String,
        serial: String,
        max_power: u32,
        #[serde(default)]
        min_power: u32,
        username: Option<String>,
        password: Option<String>,
    },
    Shelly {
        name: String,
        url: String,
        kind: DeviceKind,
    },
    Vedirect {
        name: String,
        path: String,
    },
    JbdBle {
        name: String,
        address: String,
    },
    MqttMeter {
        name: String,
    },
    MqttBattery {
        name: String,
    },
    Simulated {
        name: String,
        kinds: Vec<DeviceKind>,
        #[serde(default)]
        power: i32,
        #[serde(default)]
        max_power: u32,
    },
}

fn default_min_percent() -> u8 {
    10
}
fn default_max_current() -> u16 {
    160
}

impl DeviceConfig {
    pub fn name(&self) -> &str {
        match self {
            DeviceConfig::Growatt { name, .. }
            | DeviceConfig::Heidelberg { name, .. }
            | DeviceConfig::Ahoy { name, .. }
            | DeviceConfig::Opendtu { name, .. }
            | DeviceConfig::Shelly { name, .. }
            | DeviceConfig::Vedirect { name, .. }
            | DeviceConfig::JbdBle { name, .. }
            | DeviceConfig::MqttMeter { name }
            | DeviceConfig::MqttBattery { name }
            | DeviceConfig::Simulated { name, .. } => name,
        }
    }

    /// Serial port this device is attached to, if any
    pub fn port(&self) -> Option<&str> {
        match self {
            DeviceConfig::Growatt { port, .. } | DeviceConfig::Heidelberg { port, .. } => Some(port),
            _ => None,
        }
    }

    /// Power table of a Growatt inverter
    pub fn lut(&self) -> Option<Result<PowerLut, LutError>> {
        match self {
            DeviceConfig::Growatt {
                max_power,
                min_percent,
                lut,
                ..
            } => Some(match lut {
                Some(points) => PowerLut::new(points.clone()),
                None => PowerLut::linear(*max_power, *min_percent),
            }),
            _ => None,
        }
    }
}

impl Config {
    /// Loads `config/default.toml` (or `$BESS_CONFIG`) overlaid with `BESS__*` env vars
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("BESS_CONFIG").unwrap_or_else(|_| DEFAULT_PATH.to_string());
        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("BESS__").split("__"));
        Self::from_figment(figment)
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let cfg: Config = figment.extract().map_err(Box::new)?;
        cfg.check()?;
        Ok(cfg)
    }

    /// Range validation plus cross-field checks. Any failure refuses startup.
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()?;

        if self.heater.activate_c >= self.heater.deactivate_c {
            return Err(ConfigError::HeaterThresholds {
                activate: self.heater.activate_c,
                deactivate: self.heater.deactivate_c,
            });
        }

        let nz = &self.netzero;
        if nz.maturity_time_span_s > nz.evaluated_time_span_s {
            return Err(ConfigError::NetZero(format!(
                "maturity_time_span_s ({}) exceeds evaluated_time_span_s ({})",
                nz.maturity_time_span_s, nz.evaluated_time_span_s
            )));
        }
        if nz.enabled && self.mqtt.live_consumption_topic.is_none() {
            return Err(ConfigError::NetZero(
                "enabled without mqtt.live_consumption_topic".into(),
            ));
        }

        let mut ports = HashSet::new();
        for port in &self.serial {
            if !ports.insert(port.name.as_str()) {
                return Err(ConfigError::DuplicatePort(port.name.clone()));
            }
        }

        let mut names = HashSet::new();
        for device in &self.devices {
            let name = device.name();
            if !names.insert(name) {
                return Err(ConfigError::DuplicateDevice(name.to_string()));
            }
            if let Some(port) = device.port() {
                if !ports.contains(port) {
                    return Err(ConfigError::UnknownSerialPort {
                        device: name.to_string(),
                        port: port.to_string(),
                    });
                }
            }
            if let Some(Err(source)) = device.lut() {
                return Err(ConfigError::Lut {
                    device: name.to_string(),
                    source,
                });
            }
            if let DeviceConfig::MqttMeter { .. } = device {
                if self.mqtt.live_consumption_topic.is_none() {
                    return Err(ConfigError::Device {
                        device: name.to_string(),
                        reason: "mqtt_meter needs mqtt.live_consumption_topic".into(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn has_kind(&self, kind: DeviceKind) -> bool {
        self.devices.iter().any(|d| match d {
            DeviceConfig::Growatt { .. } | DeviceConfig::Ahoy { .. } | DeviceConfig::Opendtu { .. } => {
                kind == DeviceKind::Inverter
            }
            DeviceConfig::Heidelberg { .. } => kind == DeviceKind::Charger,
            DeviceConfig::Shelly { kind: k, .. } => *k == kind,
            DeviceConfig::Vedirect { .. } => kind == DeviceKind::Solar,
            DeviceConfig::JbdBle { .. } | DeviceConfig::MqttBattery { .. } => kind == DeviceKind::Battery,
            DeviceConfig::MqttMeter { .. } => kind == DeviceKind::Consumption,
            DeviceConfig::Simulated { kinds, .. } => kinds.contains(&kind),
        })
    }
}
