use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

// ============================================================================
// Device classification
// ============================================================================

/// Class of power device. A driver advertises one or more kinds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
    EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeviceKind {
    Battery,
    Charger,
    Inverter,
    Solar,
    Heater,
    Consumption,
}

impl DeviceKind {
    /// Topic segment used under the MQTT root (`{root}/cha/state`, ...)
    pub fn topic_segment(&self) -> &'static str {
        match self {
            DeviceKind::Battery => "bat",
            DeviceKind::Charger => "cha",
            DeviceKind::Inverter => "inv",
            DeviceKind::Solar => "sol",
            DeviceKind::Heater => "heat",
            DeviceKind::Consumption => "cons",
        }
    }

    fn bit(&self) -> u8 {
        1 << (*self as u8)
    }
}

/// Small copyable set of device kinds.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct KindSet(u8);

impl KindSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn of(kinds: &[DeviceKind]) -> Self {
        kinds.iter().fold(Self::empty(), |set, k| set.with(*k))
    }

    pub fn with(mut self, kind: DeviceKind) -> Self {
        self.insert(kind);
        self
    }

    pub fn insert(&mut self, kind: DeviceKind) {
        self.0 |= kind.bit();
    }

    pub fn contains(&self, kind: DeviceKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn union(&self, other: KindSet) -> KindSet {
        KindSet(self.0 | other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = DeviceKind> + '_ {
        DeviceKind::iter().filter(move |k| self.contains(*k))
    }
}

impl FromIterator<DeviceKind> for KindSet {
    fn from_iter<I: IntoIterator<Item = DeviceKind>>(iter: I) -> Self {
        iter.into_iter().fold(KindSet::empty(), |set, k| set.with(k))
    }
}

impl fmt::Debug for KindSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for KindSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.iter().map(|k| k.to_string()).collect();
        write!(f, "[{}]", names.join(","))
    }
}

// ============================================================================
// Status, mode, measurements
// ============================================================================

/// Reported device status.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeviceStatus {
    #[default]
    Off,
    On,
    Syncing,
    Fault,
    Offline,
}

impl DeviceStatus {
    pub fn is_on(&self) -> bool {
        matches!(self, DeviceStatus::On)
    }
}

/// Operating mode requested by the operator.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Mode {
    #[default]
    Idle,
    Charge,
    Discharge,
    Protect,
}

/// One value reported by a driver for one of its kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Measurement {
    Status(DeviceStatus),
    /// Watts
    Power(i32),
    /// Wh accumulated since the previous energy report
    Energy(u32),
}

/// A measurement tagged with its origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    pub device: std::sync::Arc<str>,
    pub kind: DeviceKind,
    pub measurement: Measurement,
}
