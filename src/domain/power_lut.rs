use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum LutError {
    #[error("power lookup table is empty")]
    Empty,
    #[error("lookup table percent {0} outside 0..=100")]
    PercentOutOfRange(u8),
    #[error("lookup table not strictly increasing at {percent}%")]
    NotMonotonic { percent: u8 },
}

/// One calibration point of an inverter's limit register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LutPoint {
    pub percent: u8,
    pub watts: u32,
}

/// Sorted mapping of limit percent to delivered watts.
///
/// Inverters that take their limit as a percentage only reach the discrete
/// watt values in this table; `set_power` requests are quantised through it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerLut {
    points: Vec<LutPoint>,
}

impl PowerLut {
    pub fn new(mut points: Vec<LutPoint>) -> Result<Self, LutError> {
        if points.is_empty() {
            return Err(LutError::Empty);
        }
        points.sort_by_key(|p| p.percent);
        points.dedup_by_key(|p| p.percent);
        for pair in points.windows(2) {
            if pair[1].watts <= pair[0].watts {
                return Err(LutError::NotMonotonic {
                    percent: pair[1].percent,
                });
            }
        }
        if let Some(p) = points.iter().find(|p| p.percent > 100) {
            return Err(LutError::PercentOutOfRange(p.percent));
        }
        Ok(Self { points })
    }

    /// Linear table from `min_percent` to 100 % of `max_power`.
    ///
    /// Below 100 W several percents round to the same watts; only the lowest
    /// percent of each such run is kept.
    pub fn linear(max_power: u32, min_percent: u8) -> Result<Self, LutError> {
        if min_percent > 100 {
            return Err(LutError::PercentOutOfRange(min_percent));
        }
        let mut points: Vec<LutPoint> = (min_percent..=100)
            .map(|percent| LutPoint {
                percent,
                watts: (max_power as u64 * percent as u64 / 100) as u32,
            })
            .collect();
        points.dedup_by_key(|p| p.watts);
        Self::new(points)
    }

    fn first(&self) -> LutPoint {
        self.points[0]
    }

    fn last(&self) -> LutPoint {
        self.points[self.points.len() - 1]
    }

    pub fn min_percent(&self) -> u8 {
        self.first().percent
    }

    pub fn min_power(&self) -> u32 {
        self.first().watts
    }

    pub fn max_power(&self) -> u32 {
        self.last().watts
    }

    /// Largest table percent whose watts do not exceed `power`.
    /// Requests below the table resolve to its lowest point.
    pub fn percent_for(&self, power: u32) -> u8 {
        self.points
            .iter()
            .rev()
            .find(|p| p.watts <= power)
            .unwrap_or(&self.points[0])
            .percent
    }

    /// Watts of the smallest table point at or above `percent`, clamped to the table.
    pub fn power_for(&self, percent: u8) -> u32 {
        self.points
            .iter()
            .find(|p| p.percent >= percent)
            .copied()
            .unwrap_or_else(|| self.last())
            .watts
    }

    /// Achievable watts for a requested setpoint
    pub fn quantize(&self, power: u32) -> u32 {
        self.power_for(self.percent_for(power))
    }

    pub fn points(&self) -> &[LutPoint] {
        &self.points
    }
}
