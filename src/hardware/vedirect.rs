//! Victron MPPT charge controller over the VE.Direct text protocol.
//!
//! The controller streams a block of `LABEL\tVALUE` lines about once a
//! second, closed by a `Checksum` line. Only `PPV`, `CS` and `H20` are used.
//! The solar path cannot be switched remotely.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

use super::{Channel, Driver, DriverError, FailureCounter};
use crate::domain::{DeviceKind, DeviceStatus, KindSet};

/// Charger states counted as producing: bulk, absorption, float, equalize, external control
const PRODUCING_STATES: [u16; 5] = [3, 4, 5, 7, 247];

const BLOCK_TIMEOUT: Duration = Duration::from_secs(10);
const REOPEN_DELAY: Duration = Duration::from_secs(5);
const OFFLINE_AFTER: u32 = 3;

/// Collects lines into blocks
#[derive(Debug, Default)]
pub struct BlockParser {
    fields: HashMap<String, String>,
}

impl BlockParser {
    /// Returns the finished block when `line` closes one
    pub fn feed(&mut self, line: &str) -> Option<HashMap<String, String>> {
        let line = line.trim_end_matches(['\r', '\n']);
        // HEX protocol frames interleave with text blocks
        if line.starts_with(':') || line.is_empty() {
            return None;
        }
        let (label, value) = line.split_once('\t')?;
        if label == "Checksum" {
            return Some(std::mem::take(&mut self.fields));
        }
        self.fields.insert(label.to_string(), value.to_string());
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reading {
    pub watts: Option<i32>,
    pub state: Option<u16>,
    /// Yield today in Wh
    pub yield_today_wh: Option<u32>,
}

impl Reading {
    pub fn from_block(block: &HashMap<String, String>) -> Self {
        let parse = |label: &str| block.get(label).and_then(|v| v.trim().parse::<i64>().ok());
        Self {
            watts: parse("PPV").map(|v| v as i32),
            state: parse("CS").map(|v| v as u16),
            // 0.01 kWh
            yield_today_wh: parse("H20").map(|v| (v * 10) as u32),
        }
    }

    pub fn status(&self) -> Option<DeviceStatus> {
        self.state.map(|cs| {
            if PRODUCING_STATES.contains(&cs) {
                DeviceStatus::On
            } else {
                DeviceStatus::Off
            }
        })
    }
}

pub struct VeDirect {
    name: Arc<str>,
    path: String,
    channel: Channel,
    failures: FailureCounter,
    last_yield_wh: Mutex<Option<u32>>,
}

impl VeDirect {
    pub fn new(name: &str, path: &str) -> Self {
        let name: Arc<str> = Arc::from(name);
        Self {
            channel: Channel::new(&name, DeviceKind::Solar),
            name,
            path: path.to_string(),
            failures: FailureCounter::new(OFFLINE_AFTER),
            last_yield_wh: Mutex::new(None),
        }
    }

    fn publish(&self, reading: Reading) {
        if let Some(status) = reading.status() {
            self.channel.publish_status(status);
        }
        if let Some(watts) = reading.watts {
            self.channel.publish_power(watts);
        }
        if let Some(today) = reading.yield_today_wh {
            let previous = self.last_yield_wh.lock().replace(today);
            match previous {
                Some(previous) if today >= previous => {
                    if today > previous {
                        self.channel.publish_energy(today - previous);
                    }
                }
                // day rollover
                Some(_) => self.channel.publish_energy(today),
                None => {}
            }
        }
    }

    fn failed(&self, e: &DriverError) {
        warn!(device = %self.name, error = %e, failures = self.failures.count() + 1, "ve.direct read failed");
        if self.failures.failure() {
            self.channel.publish_status(DeviceStatus::Offline);
        }
    }

    /// Reads blocks until the stream ends or stays silent for too long
    pub async fn consume<R: AsyncBufRead + Unpin>(&self, reader: R) -> Result<(), DriverError> {
        let mut lines = reader.lines();
        let mut parser = BlockParser::default();
        let mut deadline = tokio::time::Instant::now() + BLOCK_TIMEOUT;
        loop {
            let line = tokio::time::timeout_at(deadline, lines.next_line())
                .await
                .map_err(|_| DriverError::Timeout {
                    op: "ve.direct block",
                    after: BLOCK_TIMEOUT,
                })??;
            let Some(line) = line else {
                return Err(DriverError::Transport("ve.direct stream closed".into()));
            };
            if let Some(block) = parser.feed(&line) {
                self.failures.success();
                self.publish(Reading::from_block(&block));
                deadline = tokio::time::Instant::now() + BLOCK_TIMEOUT;
            }
        }
    }

    #[cfg(feature = "serial")]
    async fn open(&self) -> Result<Box<dyn tokio::io::AsyncRead + Unpin + Send>, DriverError> {
        use tokio_serial::SerialPortBuilderExt;
        let stream = tokio_serial::new(&self.path, 19_200)
            .open_native_async()
            .map_err(|e| DriverError::Transport(format!("{}: {e}", self.path)))?;
        Ok(Box::new(stream))
    }

    #[cfg(not(feature = "serial"))]
    async fn open(&self) -> Result<Box<dyn tokio::io::AsyncRead + Unpin + Send>, DriverError> {
        // expects the tty to be configured for 19200 8N1 already
        let file = tokio::fs::File::open(&self.path).await?;
        Ok(Box::new(file))
    }
}

#[async_trait]
impl Driver for VeDirect {
    fn name(&self) -> &str {
        &self.name
    }

    fn kinds(&self) -> KindSet {
        KindSet::of(&[DeviceKind::Solar])
    }

    fn channel(&self, kind: DeviceKind) -> Option<&Channel> {
        (kind == DeviceKind::Solar).then_some(&self.channel)
    }

    async fn switch(&self, kind: DeviceKind, on: bool) -> Result<(), DriverError> {
        if kind != DeviceKind::Solar {
            return Err(DriverError::WrongKind(kind));
        }
        debug!(device = %self.name, on, "no remote switch, request ignored");
        Ok(())
    }

    async fn run(&self) {
        loop {
            let result = match self.open().await {
                Ok(port) => self.consume(BufReader::new(port)).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                self.failed(&e);
            }
            tokio::time::sleep(REOPEN_DELAY).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = "PID\t0xA053\r\nV\t13170\r\nPPV\t245\r\nCS\t3\r\nH20\t12\r\nChecksum\t\x07\r\n\
                          :A0102000543\r\n\
                          PPV\t250\r\nCS\t0\r\nH20\t15\r\nChecksum\t\x01\r\n";

    #[test]
    fn test_block_parser() {
        let mut parser = BlockParser::default();
        assert_eq!(parser.feed("PPV\t245"), None);
        assert_eq!(parser.feed(":A0102000543"), None);
        let block = parser.feed("Checksum\tX").unwrap();
        assert_eq!(block.get("PPV").map(String::as_str), Some("245"));
        assert!(parser.feed("Checksum\tX").unwrap().is_empty());
    }

    #[test]
    fn test_reading_status_mapping() {
        for (cs, expected) in [(3, DeviceStatus::On), (247, DeviceStatus::On), (0, DeviceStatus::Off), (2, DeviceStatus::Off)] {
            let reading = Reading { watts: None, state: Some(cs), yield_today_wh: None };
            assert_eq!(reading.status(), Some(expected));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_publishes_and_reports_closed_stream() {
        let device = VeDirect::new("mppt", "/dev/null");
        let result = device.consume(STREAM.as_bytes()).await;
        assert!(matches!(result, Err(DriverError::Transport(_))));

        let snap = device.snapshot(DeviceKind::Solar);
        assert_eq!(snap.status, Some(DeviceStatus::Off));
        assert_eq!(snap.power, Some(250));
        // H20 went from 0.12 to 0.15 kWh
        assert_eq!(snap.energy, Some(30));
    }

    #[test]
    fn test_yield_rollover() {
        let device = VeDirect::new("mppt", "/dev/null");
        let at = |wh| Reading { watts: None, state: None, yield_today_wh: Some(wh) };
        device.publish(at(500));
        device.publish(at(20));
        assert_eq!(device.snapshot(DeviceKind::Solar).energy, Some(20));
    }
}
