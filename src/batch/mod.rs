//! Batch partitioning, fault isolation, concurrency governing and the
//! run orchestrator.

pub mod aggregate;
pub mod governor;
pub mod isolate;
pub mod orchestrator;
pub mod ports;
pub mod shard;

pub use aggregate::{extract_outbound, AggregatedConfig};
pub use governor::Governor;
pub use isolate::{FaultIsolator, Isolation};
pub use orchestrator::{BatchReport, BatchRunner};
pub use ports::{port_is_free, PortAllocator};
pub use shard::{PreparedShard, ShardPlan, ShardRuntime, ShardTimings};
