pub mod client;
pub mod types;
pub mod udp;

pub use types::{Address, Credentials, ProxyEndpoint, ProxyKind};
