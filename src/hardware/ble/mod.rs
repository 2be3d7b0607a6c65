//! Bluetooth Low Energy plumbing.
//!
//! The GATT stack itself is injected as a [`GattTransport`]; this module
//! only owns the single-tenant radio policy. A driver that finds the radio
//! busy fails its poll immediately instead of queueing.

pub mod jbd;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::DriverError;

pub use jbd::JbdBms;

/// 16-bit GATT UUID
pub type ShortUuid = u16;

/// Connected GATT client for one peripheral
#[async_trait]
pub trait GattSession: Send {
    /// Resolves `service` and checks it exposes `characteristics`
    async fn discover(&mut self, service: ShortUuid, characteristics: &[ShortUuid]) -> Result<(), DriverError>;

    async fn subscribe(&mut self, characteristic: ShortUuid) -> Result<(), DriverError>;

    async fn write(&mut self, characteristic: ShortUuid, data: &[u8]) -> Result<(), DriverError>;

    /// Next notification from any subscribed characteristic
    async fn notification(&mut self) -> Result<Vec<u8>, DriverError>;

    async fn disconnect(&mut self) -> Result<(), DriverError>;
}

/// Platform BLE stack
#[async_trait]
pub trait GattTransport: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Box<dyn GattSession>, DriverError>;
}

/// The one radio shared by every BLE driver
#[derive(Debug, Default)]
pub struct BleRadio {
    holder: Mutex<Option<String>>,
}

/// Releases the radio on drop
#[derive(Debug)]
pub struct RadioGuard<'a> {
    radio: &'a BleRadio,
}

impl Drop for RadioGuard<'_> {
    fn drop(&mut self) {
        if let Some(address) = self.radio.holder.lock().take() {
            trace!(address, "radio released");
        }
    }
}

impl BleRadio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, address: &str) -> Result<RadioGuard<'_>, DriverError> {
        let mut holder = self.holder.lock();
        if holder.is_some() {
            return Err(DriverError::Busy);
        }
        *holder = Some(address.to_string());
        Ok(RadioGuard { radio: self })
    }

    pub fn holder(&self) -> Option<String> {
        self.holder.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_radio_is_single_tenant() {
        let radio = BleRadio::new();
        let guard = radio.try_acquire("A4:C1:38:00:00:01").unwrap();
        assert!(matches!(radio.try_acquire("A4:C1:38:00:00:02"), Err(DriverError::Busy)));
        assert_eq!(radio.holder().as_deref(), Some("A4:C1:38:00:00:01"));
        drop(guard);
        assert!(radio.try_acquire("A4:C1:38:00:00:02").is_ok());
        assert_eq!(radio.holder(), None);
    }
}
