pub mod error;
pub mod format;
pub mod system;

pub use error::{Result, SpeedtestError};
