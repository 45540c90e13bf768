use super::resolver::resolve_host;
use crate::utils::error::Result;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

/// Result of a series of direct TCP connects to a node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TcpPingReport {
    /// One entry per attempt; `None` for a failed connect.
    pub samples: Vec<Option<u32>>,
}

impl TcpPingReport {
    pub fn successes(&self) -> impl Iterator<Item = u32> + '_ {
        self.samples.iter().flatten().copied()
    }

    pub fn loss(&self) -> f64 {
        if self.samples.is_empty() {
            return 1.0;
        }
        let failed = self.samples.iter().filter(|s| s.is_none()).count();
        failed as f64 / self.samples.len() as f64
    }

    pub fn average_ms(&self) -> f64 {
        let (sum, count) = self
            .successes()
            .fold((0u64, 0u64), |(s, c), v| (s + v as u64, c + 1));
        if count == 0 {
            0.0
        } else {
            sum as f64 / count as f64
        }
    }
}

async fn connect_once(addr: SocketAddr, limit: Duration) -> Option<u32> {
    let started = Instant::now();
    match timeout(limit, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => Some(started.elapsed().as_millis().max(1) as u32),
        _ => None,
    }
}

/// Resolve `host` once, then connect `count` times. Resolution failure is an error.
pub async fn tcp_ping(host: &str, port: u16, count: usize, limit: Duration) -> Result<TcpPingReport> {
    let addr = resolve_host(host, port).await?[0];
    let mut report = TcpPingReport {
        samples: Vec::with_capacity(count),
    };
    for attempt in 0..count {
        let sample = connect_once(addr, limit).await;
        trace!(%addr, attempt, ?sample, "TCP ping");
        report.samples.push(sample);
    }
    Ok(report)
}
