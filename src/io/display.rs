use tracing::info;

use crate::domain::{DeviceKind, Mode};

/// Operator display. Implementations must not block.
#[cfg_attr(test, mockall::automock)]
pub trait Display: Send + Sync {
    /// Top lock name, empty when unlocked
    fn show_lock(&self, lock: &str);
    /// Aggregate remaining capacity (Ah)
    fn show_capacity(&self, ah: f32);
    fn show_power(&self, watts: i32);
    fn show_mode(&self, mode: Mode);
}

/// Per-class indicator lights
#[cfg_attr(test, mockall::automock)]
pub trait Indicators: Send + Sync {
    fn set(&self, kind: DeviceKind, on: bool);
}

/// Display that writes to the log; stands in for the OLED panel
#[derive(Debug, Default)]
pub struct LogDisplay;

impl Display for LogDisplay {
    fn show_lock(&self, lock: &str) {
        info!(target: "display", lock, "lock");
    }

    fn show_capacity(&self, ah: f32) {
        info!(target: "display", ah, "capacity");
    }

    fn show_power(&self, watts: i32) {
        info!(target: "display", watts, "inverter power");
    }

    fn show_mode(&self, mode: Mode) {
        info!(target: "display", %mode, "mode");
    }
}

#[derive(Debug, Default)]
pub struct LogIndicators;

impl Indicators for LogIndicators {
    fn set(&self, kind: DeviceKind, on: bool) {
        info!(target: "indicator", %kind, on, "indicator");
    }
}
