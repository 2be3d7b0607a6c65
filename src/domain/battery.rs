use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock;

/// Acceptable cell voltage range (V)
pub const CELL_VOLTAGE_RANGE: (f32, f32) = (0.5, 5.0);
/// Acceptable sensor temperature range (°C)
pub const TEMPERATURE_RANGE: (f32, f32) = (-40.0, 80.0);

/// Reasons a pack snapshot is rejected before it reaches any coordinator
#[derive(Debug, Error, PartialEq)]
pub enum PackError {
    #[error("snapshot has no capture timestamp")]
    NoTimestamp,
    #[error("snapshot carries no cell voltages")]
    NoCells,
    #[error("state of charge out of bounds: {0}%")]
    SocOutOfBounds(f32),
    #[error("cell {index} voltage implausible: {volts}V")]
    CellOutOfRange { index: usize, volts: f32 },
    #[error("temperature sensor {index} implausible: {celsius}°C")]
    TemperatureOutOfRange { index: usize, celsius: f32 },
    #[error("pack voltage {pack}V disagrees with cell sum {cells}V")]
    VoltageMismatch { pack: f32, cells: f32 },
    #[error("negative capacity or voltage")]
    Negative,
    #[error("{0} is not a finite number")]
    NotFinite(&'static str),
    #[error("malformed pack json: {0}")]
    Json(String),
}

/// Self-consistent set of measurements captured from one BMS in a single poll.
///
/// Immutable once published; shared as `Arc<BatteryPack>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatteryPack {
    pub name: String,
    /// Pack voltage (V)
    pub v: f32,
    /// Pack current (A), charge positive
    pub i: f32,
    /// State of charge (%)
    pub soc: f32,
    /// Remaining capacity (Ah)
    pub c: f32,
    /// Full capacity (Ah)
    pub c_full: f32,
    /// Cycle count
    pub n: u32,
    pub temps: Vec<f32>,
    pub cells: Vec<f32>,
    /// Monotonic seconds of capture, 0 = invalid
    pub timestamp: f64,
    #[serde(default)]
    pub is_forwarded: bool,
}

impl BatteryPack {
    /// Empty snapshot stamped with the current monotonic time
    pub fn captured(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            v: 0.0,
            i: 0.0,
            soc: 0.0,
            c: 0.0,
            c_full: 0.0,
            n: 0,
            temps: Vec::new(),
            cells: Vec::new(),
            timestamp: clock::monotonic_secs(),
            is_forwarded: false,
        }
    }

    pub fn validate(&self) -> Result<(), PackError> {
        if !(self.timestamp > 0.0 && self.timestamp.is_finite()) {
            return Err(PackError::NoTimestamp);
        }
        if self.cells.is_empty() {
            return Err(PackError::NoCells);
        }
        if !(0.0..=100.0).contains(&self.soc) {
            return Err(PackError::SocOutOfBounds(self.soc));
        }
        for (field, value) in [("v", self.v), ("i", self.i), ("c", self.c), ("c_full", self.c_full)] {
            if !value.is_finite() {
                return Err(PackError::NotFinite(field));
            }
        }
        if self.v < 0.0 || self.c < 0.0 || self.c_full < 0.0 {
            return Err(PackError::Negative);
        }
        for (index, &volts) in self.cells.iter().enumerate() {
            if !(CELL_VOLTAGE_RANGE.0..=CELL_VOLTAGE_RANGE.1).contains(&volts) {
                return Err(PackError::CellOutOfRange { index, volts });
            }
        }
        for (index, &celsius) in self.temps.iter().enumerate() {
            if !(TEMPERATURE_RANGE.0..=TEMPERATURE_RANGE.1).contains(&celsius) {
                return Err(PackError::TemperatureOutOfRange { index, celsius });
            }
        }
        let cells: f32 = self.cells.iter().sum();
        let tolerance = (self.v * 0.03).max(0.5);
        if (cells - self.v).abs() > tolerance {
            return Err(PackError::VoltageMismatch { pack: self.v, cells });
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    pub fn min_cell(&self) -> Option<f32> {
        self.cells.iter().copied().min_by(f32::total_cmp)
    }

    pub fn max_cell(&self) -> Option<f32> {
        self.cells.iter().copied().max_by(f32::total_cmp)
    }

    pub fn min_temp(&self) -> Option<f32> {
        self.temps.iter().copied().min_by(f32::total_cmp)
    }

    pub fn to_json(&self) -> String {
        // Serializing plain numbers and strings cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(json: &[u8]) -> Result<Self, PackError> {
        serde_json::from_slice(json).map_err(|e| PackError::Json(e.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// 16-cell LFP pack that passes validation
    pub fn pack(name: &str, c: f32) -> BatteryPack {
        BatteryPack {
            name: name.to_string(),
            v: 52.8,
            i: -4.2,
            soc: 64.0,
            c,
            c_full: 100.0,
            n: 123,
            temps: vec![21.5, 22.0],
            cells: vec![3.3; 16],
            timestamp: 12.5,
            is_forwarded: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::pack;
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_valid_pack() {
        assert_eq!(pack("a", 50.0).validate(), Ok(()));
    }

    #[test]
    fn test_zero_timestamp_rejected() {
        let mut p = pack("a", 50.0);
        p.timestamp = 0.0;
        assert_eq!(p.validate(), Err(PackError::NoTimestamp));
    }

    #[test]
    fn test_implausible_values_rejected() {
        let mut p = pack("a", 50.0);
        p.cells[3] = 5.2;
        assert!(matches!(p.validate(), Err(PackError::CellOutOfRange { index: 3, .. })));

        let mut p = pack("a", 50.0);
        p.temps[1] = 95.0;
        assert!(matches!(p.validate(), Err(PackError::TemperatureOutOfRange { index: 1, .. })));

        let mut p = pack("a", 50.0);
        p.soc = 101.0;
        assert_eq!(p.validate(), Err(PackError::SocOutOfBounds(101.0)));

        let mut p = pack("a", 50.0);
        p.v = 48.0;
        assert!(matches!(p.validate(), Err(PackError::VoltageMismatch { .. })));

        let mut p = pack("a", 50.0);
        p.cells.clear();
        assert_eq!(p.validate(), Err(PackError::NoCells));
    }

    #[test]
    fn test_non_finite_readings_rejected() {
        let mut p = pack("a", 50.0);
        p.v = f32::NAN;
        assert_eq!(p.validate(), Err(PackError::NotFinite("v")));

        let mut p = pack("a", 50.0);
        p.i = f32::INFINITY;
        assert_eq!(p.validate(), Err(PackError::NotFinite("i")));

        let mut p = pack("a", 50.0);
        p.c = f32::NAN;
        assert_eq!(p.validate(), Err(PackError::NotFinite("c")));

        let mut p = pack("a", 50.0);
        p.timestamp = f64::NAN;
        assert_eq!(p.validate(), Err(PackError::NoTimestamp));
    }

    #[test]
    fn test_extremes() {
        let mut p = pack("a", 50.0);
        p.cells[0] = 3.1;
        p.cells[5] = 3.45;
        assert_eq!(p.min_cell(), Some(3.1));
        assert_eq!(p.max_cell(), Some(3.45));
        assert_eq!(p.min_temp(), Some(21.5));
    }

    proptest! {
        #[test]
        fn prop_json_round_trip(
            soc in 0.0f32..=100.0,
            c in 0.0f32..300.0,
            n in 0u32..10_000,
            cell in 2.5f32..3.6,
            count in 1usize..24,
            temp in -20.0f32..60.0,
            forwarded in any::<bool>(),
        ) {
            let p = BatteryPack {
                name: "pack-1".into(),
                v: cell * count as f32,
                i: 1.5,
                soc,
                c,
                c_full: 300.0,
                n,
                temps: vec![temp],
                cells: vec![cell; count],
                timestamp: 42.0,
                is_forwarded: forwarded,
            };
            prop_assert!(p.is_valid());
            let back = BatteryPack::from_json(p.to_json().as_bytes()).unwrap();
            prop_assert_eq!(back, p);
        }
    }
}
