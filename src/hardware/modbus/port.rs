//! Shared RS-485 port.
//!
//! Every request/response exchange holds the frame lock, so frames of
//! different slaves never interleave on the wire. Drivers that need several
//! exchanges back to back take the sequence lock through
//! [`RtuPort::sequence`]; plain requests wait for it as well.

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::trace;

use super::rtu::{remaining_len, RtuFrame};
use crate::config::{Parity, SerialPortConfig};
use crate::hardware::{with_timeout, DriverError, DEFAULT_TIMEOUT};

/// Byte stream carrying RTU frames
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// 3.5 character times, fixed at 1.75 ms above 19200 baud
pub fn frame_gap(baud: u32, parity: Parity, stop_bits: u8) -> Duration {
    if baud > 19_200 {
        return Duration::from_micros(1_750);
    }
    let parity_bits = u64::from(parity != Parity::None);
    let bits_per_char = 1 + 8 + parity_bits + stop_bits as u64;
    Duration::from_micros(bits_per_char * 3_500_000 / baud.max(1) as u64)
}

struct Wire {
    transport: Box<dyn Transport>,
    last_activity: Option<Instant>,
}

pub struct RtuPort {
    name: String,
    gap: Duration,
    timeout: Duration,
    wire: Mutex<Wire>,
    sequence: Mutex<()>,
}

/// Exclusive use of the port across several exchanges
pub struct Sequence<'a> {
    port: &'a RtuPort,
    _guard: MutexGuard<'a, ()>,
}

impl Sequence<'_> {
    pub async fn request(&self, frame: &RtuFrame) -> Result<RtuFrame, DriverError> {
        self.port.exchange(frame).await
    }

    pub async fn read_holding(&self, slave: u8, addr: u16, count: u16) -> Result<Vec<u16>, DriverError> {
        self.port.read(RtuFrame::read_holding(slave, addr, count)).await
    }

    pub async fn read_input(&self, slave: u8, addr: u16, count: u16) -> Result<Vec<u16>, DriverError> {
        self.port.read(RtuFrame::read_input(slave, addr, count)).await
    }
}

impl RtuPort {
    pub fn new(name: impl Into<String>, transport: Box<dyn Transport>, gap: Duration) -> Self {
        Self {
            name: name.into(),
            gap,
            timeout: DEFAULT_TIMEOUT,
            wire: Mutex::new(Wire {
                transport,
                last_activity: None,
            }),
            sequence: Mutex::new(()),
        }
    }

    /// Opens the serial device described by `config`
    #[cfg(feature = "serial")]
    pub fn open(config: &SerialPortConfig) -> Result<Self, DriverError> {
        use tokio_serial::SerialPortBuilderExt;

        let parity = match config.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        };
        let stop_bits = if config.stop_bits == 2 {
            tokio_serial::StopBits::Two
        } else {
            tokio_serial::StopBits::One
        };
        let stream = tokio_serial::new(&config.path, config.baud)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(parity)
            .stop_bits(stop_bits)
            .open_native_async()
            .map_err(|e| DriverError::Transport(format!("{}: {e}", config.path)))?;
        Ok(Self::new(
            config.name.clone(),
            Box::new(stream),
            frame_gap(config.baud, config.parity, config.stop_bits),
        ))
    }

    #[cfg(not(feature = "serial"))]
    pub fn open(config: &SerialPortConfig) -> Result<Self, DriverError> {
        Err(DriverError::Transport(format!(
            "{}: built without serial support",
            config.path
        )))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Holds the port for several exchanges
    pub async fn sequence(&self) -> Sequence<'_> {
        Sequence {
            port: self,
            _guard: self.sequence.lock().await,
        }
    }

    pub async fn request(&self, frame: &RtuFrame) -> Result<RtuFrame, DriverError> {
        let _sequence = self.sequence.lock().await;
        self.exchange(frame).await
    }

    pub async fn read_holding(&self, slave: u8, addr: u16, count: u16) -> Result<Vec<u16>, DriverError> {
        let _sequence = self.sequence.lock().await;
        self.read(RtuFrame::read_holding(slave, addr, count)).await
    }

    pub async fn read_input(&self, slave: u8, addr: u16, count: u16) -> Result<Vec<u16>, DriverError> {
        let _sequence = self.sequence.lock().await;
        self.read(RtuFrame::read_input(slave, addr, count)).await
    }

    pub async fn write_single(&self, slave: u8, addr: u16, value: u16) -> Result<(), DriverError> {
        let request = RtuFrame::write_single(slave, addr, value);
        let reply = self.request(&request).await?;
        reply
            .check_answers(&request)
            .map_err(|e| DriverError::Protocol(e.to_string()))
    }

    async fn read(&self, request: RtuFrame) -> Result<Vec<u16>, DriverError> {
        let reply = self.exchange(&request).await?;
        reply
            .registers(&request)
            .map_err(|e| DriverError::Protocol(e.to_string()))
    }

    async fn exchange(&self, frame: &RtuFrame) -> Result<RtuFrame, DriverError> {
        let bytes = frame.encode().map_err(|e| DriverError::Protocol(e.to_string()))?;
        let mut wire = self.wire.lock().await;
        if let Some(last) = wire.last_activity {
            tokio::time::sleep_until(last + self.gap).await;
        }
        let result = with_timeout("modbus request", self.timeout, async {
            wire.transport.write_all(&bytes).await?;
            wire.transport.flush().await?;
            read_frame(&mut wire.transport).await
        })
        .await;
        wire.last_activity = Some(Instant::now());
        trace!(port = %self.name, slave = frame.slave, ok = result.is_ok(), "rtu exchange");
        result
    }
}

async fn read_frame(transport: &mut Box<dyn Transport>) -> Result<RtuFrame, DriverError> {
    let mut buf = vec![0u8; 2];
    transport.read_exact(&mut buf).await?;
    let function = buf[1];
    if function & 0x80 == 0 && matches!(function, super::rtu::READ_HOLDING | super::rtu::READ_INPUT) {
        let mut count = [0u8; 1];
        transport.read_exact(&mut count).await?;
        buf.push(count[0]);
    }
    let rest = remaining_len(&buf)
        .ok_or_else(|| DriverError::Protocol("truncated rtu header".into()))?;
    let start = buf.len();
    buf.resize(start + rest, 0);
    transport.read_exact(&mut buf[start..]).await?;
    RtuFrame::decode(&buf).map_err(|e| DriverError::Protocol(e.to_string()))
}


#[cfg(test)]
mod tests {
    use super::testing::port_with_slave;
    use super::*;

    #[test]
    fn test_frame_gap() {
        // 10 bits per char at 9600 baud
        assert_eq!(frame_gap(9600, Parity::None, 1), Duration::from_micros(3_645));
        assert_eq!(frame_gap(9600, Parity::Even, 1), Duration::from_micros(4_010));
        assert_eq!(frame_gap(115_200, Parity::None, 1), Duration::from_micros(1_750));
    }

    #[tokio::test]
    async fn test_read_and_write() {
        let (port, slave) = port_with_slave();
        slave.set_input(3, 35, 0x0001);
        slave.set_input(3, 36, 0x86A0);
        assert_eq!(port.read_input(3, 35, 2).await.unwrap(), vec![0x0001, 0x86A0]);

        port.write_single(3, 0, 1).await.unwrap();
        assert_eq!(slave.holding(3, 0), Some(1));
    }

    #[tokio::test]
    async fn test_exception_is_protocol_error() {
        let (port, _slave) = port_with_slave();
        let result = port.read_holding(3, 100, 1).await;
        assert!(matches!(result, Err(DriverError::Protocol(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_slave_times_out() {
        let (near, _far) = tokio::io::duplex(64);
        let port = RtuPort::new("rs485", Box::new(near), Duration::from_millis(4))
            .with_timeout(Duration::from_millis(500));
        let result = port.read_input(1, 0, 1).await;
        assert!(matches!(result, Err(DriverError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_sequence_holds_port() {
        let (port, slave) = port_with_slave();
        slave.set_input(1, 4, 7);
        slave.set_input(1, 14, 3_700);
        let sequence = port.sequence().await;
        assert_eq!(sequence.read_input(1, 4, 1).await.unwrap(), vec![7]);
        assert_eq!(sequence.read_input(1, 14, 1).await.unwrap(), vec![3_700]);
        drop(sequence);
        assert_eq!(slave.requests.lock().len(), 2);
    }
}
