pub mod battery;
pub mod lock;
pub mod power_lut;
pub mod types;

pub use battery::*;
pub use lock::*;
pub use power_lut::*;
pub use types::*;
