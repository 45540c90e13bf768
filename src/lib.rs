// StairSpeed - proxy node benchmarking engine

pub mod batch;
pub mod client;
pub mod config;
pub mod lookup;
pub mod node;
pub mod probe;
pub mod protocol;
pub mod results;
pub mod tester;
pub mod utils;

// Re-export commonly used types
pub use utils::error::{Result, SpeedtestError};
