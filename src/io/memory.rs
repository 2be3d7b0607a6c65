use async_trait::async_trait;
use parking_lot::Mutex;

use super::{IoError, Publisher, Qos};

/// Publisher that keeps every message in memory, for bench runs without a broker
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    messages: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(String, Vec<u8>)> {
        self.messages.lock().clone()
    }

    /// Payloads published on `topic`, oldest first
    pub fn on_topic(&self, topic: &str) -> Vec<Vec<u8>> {
        self.messages
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn last(&self, topic: &str) -> Option<Vec<u8>> {
        self.on_topic(topic).pop()
    }

    pub fn clear(&self) {
        self.messages.lock().clear();
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, topic: String, payload: Vec<u8>, _qos: Qos) -> Result<(), IoError> {
        self.messages.lock().push((topic, payload));
        Ok(())
    }
}
