//! MQTT variable byte integer: 7 bits per byte, continuation in the high bit,
//! at most four bytes.

use thiserror::Error;

pub const MAX: u32 = (1 << 28) - 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VarintError {
    #[error("value {0} exceeds the four byte limit")]
    TooLarge(u32),
    #[error("truncated variable byte integer")]
    Truncated,
    #[error("variable byte integer longer than four bytes")]
    Overlong,
}

pub fn encode(mut value: u32, out: &mut Vec<u8>) -> Result<usize, VarintError> {
    if value > MAX {
        return Err(VarintError::TooLarge(value));
    }
    let start = out.len();
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            return Ok(out.len() - start);
        }
    }
}

/// Returns the value and the number of bytes consumed
pub fn decode(bytes: &[u8]) -> Result<(u32, usize), VarintError> {
    let mut value: u32 = 0;
    for (i, byte) in bytes.iter().enumerate() {
        if i == 4 {
            return Err(VarintError::Overlong);
        }
        value |= ((byte & 0x7F) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    if bytes.len() >= 4 {
        Err(VarintError::Overlong)
    } else {
        Err(VarintError::Truncated)
    }
}
