//! Modbus RTU devices on shared RS-485 ports.

pub mod growatt;
pub mod heidelberg;
pub mod port;
pub mod rtu;

pub use growatt::Growatt;
pub use heidelberg::Heidelberg;
pub use port::{frame_gap, RtuPort, Sequence, Transport};
pub use rtu::{crc16, FrameError, RtuFrame};
