use crate::protocol::types::Address;
use crate::utils::error::{Result, SpeedtestError};
use std::net::{IpAddr, SocketAddr};
use tracing::instrument;

/// Resolve a node host into socket addresses, preferring IPv4 entries first.
#[instrument(level = "debug")]
pub async fn resolve_host(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let mut targets = match Address::from_host(host).to_socket_addr(port) {
        Some(addr) => vec![addr],
        None => tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| SpeedtestError::Resolve(format!("{}: {}", host, e)))?
            .collect(),
    };

    // IPv4 first, resolver order kept within each family.
    targets.sort_by_key(|addr| match addr.ip() {
        IpAddr::V4(_) => 0,
        IpAddr::V6(_) => 1,
    });

    if targets.is_empty() {
        return Err(SpeedtestError::Resolve(format!(
            "{}: no addresses found",
            host
        )));
    }

    Ok(targets)
}
