//! Modbus RTU framing: slave address, PDU, CRC-16/MODBUS little-endian.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use thiserror::Error;

/// Largest PDU that fits a 256 byte RTU frame
pub const MAX_PDU: usize = 253;

pub const READ_HOLDING: u8 = 0x03;
pub const READ_INPUT: u8 = 0x04;
pub const WRITE_SINGLE: u8 = 0x06;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short ({0} bytes)")]
    TooShort(usize),
    #[error("pdu of {0} bytes exceeds the RTU limit")]
    TooLong(usize),
    #[error("crc mismatch: computed {computed:#06x}, received {received:#06x}")]
    Crc { computed: u16, received: u16 },
    #[error("exception {code:#04x} on function {function:#04x}")]
    Exception { function: u8, code: u8 },
    #[error("unexpected response: {0}")]
    Unexpected(String),
}

pub fn crc16(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in bytes {
        crc ^= *byte as u16;
        for _ in 0..8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ 0xA001 } else { crc >> 1 };
        }
    }
    crc
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtuFrame {
    pub slave: u8,
    pub pdu: Vec<u8>,
}

impl RtuFrame {
    pub fn new(slave: u8, pdu: Vec<u8>) -> Self {
        Self { slave, pdu }
    }

    pub fn read_holding(slave: u8, addr: u16, count: u16) -> Self {
        Self::new(slave, addressed(READ_HOLDING, addr, count))
    }

    pub fn read_input(slave: u8, addr: u16, count: u16) -> Self {
        Self::new(slave, addressed(READ_INPUT, addr, count))
    }

    pub fn write_single(slave: u8, addr: u16, value: u16) -> Self {
        Self::new(slave, addressed(WRITE_SINGLE, addr, value))
    }

    pub fn function(&self) -> Option<u8> {
        self.pdu.first().copied()
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        if self.pdu.len() > MAX_PDU {
            return Err(FrameError::TooLong(self.pdu.len()));
        }
        let mut out = Vec::with_capacity(self.pdu.len() + 3);
        out.push(self.slave);
        out.extend_from_slice(&self.pdu);
        let mut crc = [0u8; 2];
        LittleEndian::write_u16(&mut crc, crc16(&out));
        out.extend_from_slice(&crc);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < 4 {
            return Err(FrameError::TooShort(bytes.len()));
        }
        if bytes.len() > MAX_PDU + 3 {
            return Err(FrameError::TooLong(bytes.len() - 3));
        }
        let (body, tail) = bytes.split_at(bytes.len() - 2);
        let received = LittleEndian::read_u16(tail);
        let computed = crc16(body);
        if received != computed {
            return Err(FrameError::Crc { computed, received });
        }
        Ok(Self::new(body[0], body[1..].to_vec()))
    }

    /// Register values of a read response, after checking it answers `request`
    pub fn registers(&self, request: &RtuFrame) -> Result<Vec<u16>, FrameError> {
        self.check_answers(request)?;
        let count = self.pdu.get(1).copied().unwrap_or(0) as usize;
        let data = self.pdu.get(2..2 + count).ok_or_else(|| {
            FrameError::Unexpected(format!("byte count {count} exceeds payload"))
        })?;
        if count % 2 != 0 {
            return Err(FrameError::Unexpected(format!("odd byte count {count}")));
        }
        Ok(data.chunks_exact(2).map(BigEndian::read_u16).collect())
    }

    pub fn check_answers(&self, request: &RtuFrame) -> Result<(), FrameError> {
        if self.slave != request.slave {
            return Err(FrameError::Unexpected(format!(
                "answer from slave {} to request for {}",
                self.slave, request.slave
            )));
        }
        match (self.function(), request.function()) {
            (Some(f), Some(r)) if f == r | 0x80 => Err(FrameError::Exception {
                function: r,
                code: self.pdu.get(1).copied().unwrap_or(0),
            }),
            (Some(f), Some(r)) if f == r => Ok(()),
            (f, r) => Err(FrameError::Unexpected(format!("function {f:?} answering {r:?}"))),
        }
    }
}

fn addressed(function: u8, addr: u16, value: u16) -> Vec<u8> {
    let mut pdu = vec![function, 0, 0, 0, 0];
    BigEndian::write_u16(&mut pdu[1..3], addr);
    BigEndian::write_u16(&mut pdu[3..5], value);
    pdu
}

/// Bytes still missing after the first `head` bytes (slave, function and,
/// for reads, the byte count) of a response have arrived
pub fn remaining_len(head: &[u8]) -> Option<usize> {
    let function = *head.get(1)?;
    if function & 0x80 != 0 {
        return Some(3usize.saturating_sub(head.len() - 2));
    }
    match function {
        READ_HOLDING | READ_INPUT => head.get(2).map(|count| *count as usize + 2),
        _ => Some(6usize.saturating_sub(head.len() - 2)),
    }
}
