use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use super::ble::{BleRadio, GattTransport, JbdBms};
use super::http::{Ahoy, OpenDtu, Shelly};
use super::modbus::{Growatt, Heidelberg, RtuPort};
use super::mqtt::{MqttBattery, MqttMeter};
use super::simulated::{SimulatedBattery, SimulatedDevice, SimulatedInverter};
use super::vedirect::VeDirect;
use super::{DriverError, Fleet};
use crate::config::{Config, ConfigError, DeviceConfig};
use crate::domain::{DeviceKind, KindSet};
use crate::io::mqtt::MqttLink;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("serial port {port}: {source}")]
    Port {
        port: String,
        #[source]
        source: DriverError,
    },
    #[error("device {device}: {source}")]
    Driver {
        device: String,
        #[source]
        source: DriverError,
    },
}

/// Platform services the drivers are built on
#[derive(Default)]
pub struct Environment {
    pub link: Option<Arc<MqttLink>>,
    /// BLE stack; `jbd_ble` devices cannot be built without one
    pub ble: Option<Arc<dyn GattTransport>>,
    /// Ports opened up front, by name; the rest are opened from config
    pub ports: BTreeMap<String, Arc<RtuPort>>,
}

/// Builds the driver fleet from the device list
pub struct DeviceFactory {
    env: Environment,
    radio: Arc<BleRadio>,
}

impl DeviceFactory {
    pub fn new(env: Environment) -> Self {
        Self {
            env,
            radio: Arc::new(BleRadio::new()),
        }
    }

    fn port(&mut self, config: &Config, device: &str, name: &str) -> Result<Arc<RtuPort>, BuildError> {
        if let Some(port) = self.env.ports.get(name) {
            return Ok(port.clone());
        }
        let Some(serial) = config.serial.iter().find(|p| p.name == name) else {
            return Err(ConfigError::UnknownSerialPort {
                device: device.to_string(),
                port: name.to_string(),
            }
            .into());
        };
        let port = Arc::new(RtuPort::open(serial).map_err(|source| BuildError::Port {
            port: name.to_string(),
            source,
        })?);
        self.env.ports.insert(name.to_string(), port.clone());
        Ok(port)
    }

    fn link(&self, device: &str) -> Result<&Arc<MqttLink>, BuildError> {
        self.env.link.as_ref().ok_or_else(|| {
            ConfigError::Device {
                device: device.to_string(),
                reason: "needs the mqtt link".into(),
            }
            .into()
        })
    }

    pub fn build(mut self, config: &Config) -> Result<Fleet, BuildError> {
        let mut fleet = Fleet::new();
        for device in &config.devices {
            self.add(&mut fleet, config, device)?;
            info!(device = device.name(), "device registered");
        }
        Ok(fleet)
    }

    fn add(&mut self, fleet: &mut Fleet, config: &Config, device: &DeviceConfig) -> Result<(), BuildError> {
        let driver_err = |source: DriverError| BuildError::Driver {
            device: device.name().to_string(),
            source,
        };
        match device {
            DeviceConfig::Growatt { name, port, slave, .. } => {
                let lut = device
                    .lut()
                    .transpose()
                    .map_err(|source| ConfigError::Lut {
                        device: name.clone(),
                        source,
                    })?
                    .ok_or_else(|| ConfigError::Device {
                        device: name.clone(),
                        reason: "no power table".into(),
                    })?;
                let port = self.port(config, name, port)?;
                fleet.add_inverter(Arc::new(Growatt::new(name, port, *slave, lut)));
            }
            DeviceConfig::Heidelberg {
                name,
                port,
                slave,
                max_current_da,
            } => {
                let port = self.port(config, name, port)?;
                fleet.add(Arc::new(Heidelberg::new(name, port, *slave, *max_current_da)));
            }
            DeviceConfig::Ahoy {
                name,
                url,
                inverter_id,
                max_power,
                min_power,
            } => {
                let ahoy = Ahoy::new(name, url, *inverter_id, *min_power, *max_power).map_err(driver_err)?;
                fleet.add_inverter(Arc::new(ahoy));
            }
            DeviceConfig::Opendtu {
                name,
                url,
                serial,
                max_power,
                min_power,
                username,
                password,
            } => {
                let credentials = username.clone().zip(password.clone());
                let dtu = OpenDtu::new(name, url, serial, *min_power, *max_power, credentials).map_err(driver_err)?;
                fleet.add_inverter(Arc::new(dtu));
            }
            DeviceConfig::Shelly { name, url, kind } => {
                fleet.add(Arc::new(Shelly::new(name, url, *kind).map_err(driver_err)?));
            }
            DeviceConfig::Vedirect { name, path } => {
                fleet.add(Arc::new(VeDirect::new(name, path)));
            }
            DeviceConfig::JbdBle { name, address } => {
                let Some(transport) = self.env.ble.clone() else {
                    return Err(ConfigError::BleUnavailable(name.clone()).into());
                };
                fleet.add_battery(Arc::new(JbdBms::new(name, address, transport, self.radio.clone())));
            }
            DeviceConfig::MqttMeter { name } => {
                let link = self.link(name)?;
                let topic = config.mqtt.live_consumption_topic.as_deref().ok_or_else(|| ConfigError::Device {
                    device: name.clone(),
                    reason: "mqtt_meter needs mqtt.live_consumption_topic".into(),
                })?;
                let meter = MqttMeter::new(name);
                meter.attach(link, topic);
                fleet.add(meter);
            }
            DeviceConfig::MqttBattery { name } => {
                let link = self.link(name)?;
                let battery = MqttBattery::new(name);
                battery.attach(link);
                fleet.add_battery(battery);
            }
            DeviceConfig::Simulated {
                name,
                kinds,
                power,
                max_power,
            } => match kinds.as_slice() {
                [DeviceKind::Inverter] => {
                    fleet.add_inverter(Arc::new(SimulatedInverter::new(name, 0, *max_power)));
                }
                [DeviceKind::Battery] => fleet.add_battery(Arc::new(SimulatedBattery::nominal(name))),
                kinds if kinds.iter().any(|k| matches!(k, DeviceKind::Inverter | DeviceKind::Battery)) => {
                    return Err(ConfigError::Device {
                        device: name.clone(),
                        reason: "simulated inverters and batteries take a single kind".into(),
                    }
                    .into())
                }
                kinds => {
                    let device = SimulatedDevice::new(name, KindSet::of(kinds)).with_power(*power);
                    fleet.add(Arc::new(device));
                }
            },
        }
        Ok(())
    }
}
