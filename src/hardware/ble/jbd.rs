//! JBD (Jiabaida) smart BMS over BLE.
//!
//! Each poll holds the radio for the whole exchange: connect, discover
//! service FF00, subscribe to FF01, write the basic-info and cell-voltage
//! requests to FF02, reassemble both replies from notifications, verify
//! their checksums and disconnect.

use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use super::{BleRadio, GattSession, GattTransport, ShortUuid};
use crate::domain::{BatteryPack, DeviceKind, DeviceStatus, KindSet};
use crate::hardware::{
    with_timeout, BatteryDriver, Channel, Driver, DriverError, FailureCounter, PackChannel, Sink,
    BLE_CONNECT_TIMEOUT, DEFAULT_TIMEOUT,
};

pub const SERVICE: ShortUuid = 0xFF00;
pub const NOTIFY: ShortUuid = 0xFF01;
pub const WRITE: ShortUuid = 0xFF02;

const START: u8 = 0xDD;
const END: u8 = 0x77;
const READ: u8 = 0xA5;
pub const CMD_BASIC_INFO: u8 = 0x03;
pub const CMD_CELL_VOLTAGES: u8 = 0x04;

const POLL_INTERVAL: Duration = Duration::from_secs(30);
const OFFLINE_AFTER: u32 = 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JbdError {
    #[error("reply to command {0:#04x} reports error status {1:#04x}")]
    Status(u8, u8),
    #[error("checksum mismatch: computed {computed:#06x}, received {received:#06x}")]
    Checksum { computed: u16, received: u16 },
    #[error("malformed reply: {0}")]
    Malformed(&'static str),
}

impl From<JbdError> for DriverError {
    fn from(e: JbdError) -> Self {
        DriverError::Protocol(e.to_string())
    }
}

/// Two's complement of the byte sum, as the BMS computes it
pub fn checksum(bytes: &[u8]) -> u16 {
    let sum: u32 = bytes.iter().map(|b| *b as u32).sum();
    (0x10000 - (sum & 0xFFFF)) as u16
}

pub fn request(command: u8) -> Vec<u8> {
    let body = [command, 0x00];
    let mut out = vec![START, READ];
    out.extend_from_slice(&body);
    let mut chk = [0u8; 2];
    BigEndian::write_u16(&mut chk, checksum(&body));
    out.extend_from_slice(&chk);
    out.push(END);
    out
}

/// Rebuilds one reply frame from notification chunks
#[derive(Debug, Default)]
pub struct Reassembler {
    buf: Vec<u8>,
}

impl Reassembler {
    pub fn push(&mut self, chunk: &[u8]) -> Option<Vec<u8>> {
        self.buf.extend_from_slice(chunk);
        // drop anything before a frame start
        match self.buf.iter().position(|b| *b == START) {
            Some(0) => {}
            Some(i) => {
                self.buf.drain(..i);
            }
            None => {
                self.buf.clear();
                return None;
            }
        }
        let len = *self.buf.get(3)? as usize;
        let total = 4 + len + 3;
        if self.buf.len() < total {
            return None;
        }
        let frame: Vec<u8> = self.buf.drain(..total).collect();
        Some(frame)
    }
}

/// Payload of a reply frame after status and checksum checks
pub fn payload(frame: &[u8], command: u8) -> Result<&[u8], JbdError> {
    if frame.len() < 7 || frame[0] != START || frame[frame.len() - 1] != END {
        return Err(JbdError::Malformed("frame delimiters"));
    }
    if frame[1] != command {
        return Err(JbdError::Malformed("reply to another command"));
    }
    let len = frame[3] as usize;
    if frame.len() != 4 + len + 3 {
        return Err(JbdError::Malformed("length field"));
    }
    let received = BigEndian::read_u16(&frame[4 + len..4 + len + 2]);
    let computed = checksum(&frame[2..4 + len]);
    if received != computed {
        return Err(JbdError::Checksum { computed, received });
    }
    if frame[2] != 0 {
        return Err(JbdError::Status(command, frame[2]));
    }
    Ok(&frame[4..4 + len])
}

#[derive(Debug, Clone, PartialEq)]
pub struct BasicInfo {
    pub volts: f32,
    pub amps: f32,
    pub remaining_ah: f32,
    pub nominal_ah: f32,
    pub cycles: u16,
    pub protection: u16,
    pub soc: u8,
    pub cell_count: u8,
    pub temps: Vec<f32>,
}

pub fn parse_basic_info(data: &[u8]) -> Result<BasicInfo, JbdError> {
    if data.len() < 23 {
        return Err(JbdError::Malformed("basic info too short"));
    }
    let ntc = data[22] as usize;
    let temps = data
        .get(23..23 + 2 * ntc)
        .ok_or(JbdError::Malformed("temperature block truncated"))?
        .chunks_exact(2)
        // 0.1 K
        .map(|t| (BigEndian::read_u16(t) as f32 - 2731.0) / 10.0)
        .collect();
    Ok(BasicInfo {
        volts: BigEndian::read_u16(&data[0..2]) as f32 / 100.0,
        amps: BigEndian::read_i16(&data[2..4]) as f32 / 100.0,
        remaining_ah: BigEndian::read_u16(&data[4..6]) as f32 / 100.0,
        nominal_ah: BigEndian::read_u16(&data[6..8]) as f32 / 100.0,
        cycles: BigEndian::read_u16(&data[8..10]),
        protection: BigEndian::read_u16(&data[16..18]),
        soc: data[19],
        cell_count: data[21],
        temps,
    })
}

pub fn parse_cells(data: &[u8]) -> Vec<f32> {
    data.chunks_exact(2)
        .map(|c| BigEndian::read_u16(c) as f32 / 1000.0)
        .collect()
}

pub struct JbdBms {
    name: Arc<str>,
    address: String,
    transport: Arc<dyn GattTransport>,
    radio: Arc<BleRadio>,
    channel: Channel,
    packs: PackChannel,
    failures: FailureCounter,
}

impl JbdBms {
    pub fn new(name: &str, address: &str, transport: Arc<dyn GattTransport>, radio: Arc<BleRadio>) -> Self {
        let name: Arc<str> = Arc::from(name);
        Self {
            channel: Channel::new(&name, DeviceKind::Battery),
            name,
            address: address.to_string(),
            transport,
            radio,
            packs: PackChannel::default(),
            failures: FailureCounter::new(OFFLINE_AFTER),
        }
    }

    async fn query(&self, session: &mut dyn GattSession, command: u8) -> Result<Vec<u8>, DriverError> {
        with_timeout("ble write", DEFAULT_TIMEOUT, session.write(WRITE, &request(command))).await?;
        let mut reassembler = Reassembler::default();
        let frame = with_timeout("ble reply", DEFAULT_TIMEOUT, async {
            loop {
                let chunk = session.notification().await?;
                if let Some(frame) = reassembler.push(&chunk) {
                    return Ok::<_, DriverError>(frame);
                }
            }
        })
        .await?;
        Ok(payload(&frame, command)?.to_vec())
    }

    async fn exchange(&self, session: &mut dyn GattSession) -> Result<BatteryPack, DriverError> {
        with_timeout("ble discover", DEFAULT_TIMEOUT, session.discover(SERVICE, &[NOTIFY, WRITE])).await?;
        with_timeout("ble subscribe", DEFAULT_TIMEOUT, session.subscribe(NOTIFY)).await?;
        let info = parse_basic_info(&self.query(session, CMD_BASIC_INFO).await?)?;
        let cells = parse_cells(&self.query(session, CMD_CELL_VOLTAGES).await?);
        if cells.len() != info.cell_count as usize {
            debug!(device = %self.name, reported = info.cell_count, received = cells.len(), "cell count differs");
        }
        if info.protection != 0 {
            warn!(device = %self.name, protection = info.protection, "bms protection active");
        }
        let mut pack = BatteryPack::captured(self.name.to_string());
        pack.v = info.volts;
        pack.i = info.amps;
        pack.soc = info.soc as f32;
        pack.c = info.remaining_ah;
        pack.c_full = info.nominal_ah;
        pack.n = info.cycles as u32;
        pack.temps = info.temps;
        pack.cells = cells;
        Ok(pack)
    }

    async fn poll(&self) -> Result<BatteryPack, DriverError> {
        let _radio = self.radio.try_acquire(&self.address)?;
        let mut session = with_timeout("ble connect", BLE_CONNECT_TIMEOUT, self.transport.connect(&self.address)).await?;
        let result = self.exchange(session.as_mut()).await;
        if let Err(e) = with_timeout("ble disconnect", DEFAULT_TIMEOUT, session.disconnect()).await {
            debug!(device = %self.name, error = %e, "disconnect failed");
        }
        result
    }
}

#[async_trait]
impl Driver for JbdBms {
    fn name(&self) -> &str {
        &self.name
    }

    fn kinds(&self) -> KindSet {
        KindSet::of(&[DeviceKind::Battery])
    }

    fn channel(&self, kind: DeviceKind) -> Option<&Channel> {
        (kind == DeviceKind::Battery).then_some(&self.channel)
    }

    async fn switch(&self, _kind: DeviceKind, _on: bool) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("switch"))
    }

    async fn run(&self) {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            ticker.tick().await;
            self.read().await;
        }
    }
}

#[async_trait]
impl BatteryDriver for JbdBms {
    async fn read(&self) -> Option<Arc<BatteryPack>> {
        match self.poll().await {
            Ok(pack) => {
                self.failures.success();
                let published = self.packs.publish(pack);
                self.channel.publish_status(if published.is_some() {
                    DeviceStatus::On
                } else {
                    DeviceStatus::Fault
                });
                published
            }
            Err(e) => {
                warn!(device = %self.name, error = %e, failures = self.failures.count() + 1, "bms poll failed");
                if self.failures.failure() {
                    self.channel.publish_status(DeviceStatus::Offline);
                }
                None
            }
        }
    }

    fn subscribe_packs(&self, sink: Sink<Arc<BatteryPack>>) {
        self.packs.subscribe(sink);
    }
}
