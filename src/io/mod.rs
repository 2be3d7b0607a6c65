//! Outbound sinks and the MQTT boundary.

pub mod display;
pub mod memory;
pub mod mqtt;
pub mod payload;
pub mod topics;
pub mod varint;

use async_trait::async_trait;
use thiserror::Error;

pub use display::{Display, Indicators, LogDisplay, LogIndicators};
pub use memory::MemoryPublisher;
pub use topics::Topics;

#[derive(Debug, Error)]
pub enum IoError {
    #[error("broker not connected")]
    NotConnected,
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
}

/// Outbound message sink (the MQTT client in production)
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: String, payload: Vec<u8>, qos: Qos) -> Result<(), IoError>;
}
