use crate::config::ProbeConfig;
use crate::protocol::client::negotiate;
use crate::protocol::{ProxyEndpoint, ProxyKind};
use crate::utils::error::{Result, SpeedtestError};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, trace};

/// Decides whether a proxy endpoint is accepting requests.
#[async_trait]
pub trait ReadinessCheck: Send + Sync {
    /// Poll until ready or until `limit` elapses.
    async fn wait_ready(&self, endpoint: &ProxyEndpoint, limit: Duration) -> bool;
}

/// Polls an endpoint with a TCP connect plus SOCKS5 method negotiation.
#[derive(Debug, Clone)]
pub struct ReadinessProber {
    probe_timeout: Duration,
    backoff: Duration,
}

impl ReadinessProber {
    pub fn new(probe_timeout: Duration, backoff: Duration) -> Self {
        Self {
            probe_timeout,
            backoff,
        }
    }

    pub fn from_config(config: &ProbeConfig) -> Self {
        Self::new(
            Duration::from_millis(config.readiness_probe_timeout_ms),
            Duration::from_millis(config.readiness_backoff_ms),
        )
    }

    /// One connect + handshake attempt.
    pub async fn probe_once(&self, endpoint: &ProxyEndpoint, limit: Duration) -> Result<()> {
        timeout(limit, async {
            let mut stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
            if endpoint.kind == ProxyKind::Socks5 {
                negotiate(&mut stream, endpoint.credentials.as_ref()).await?;
            }
            Ok::<_, SpeedtestError>(())
        })
        .await
        .map_err(|_| SpeedtestError::timeout("readiness probe"))?
    }
}

#[async_trait]
impl ReadinessCheck for ReadinessProber {
    async fn wait_ready(&self, endpoint: &ProxyEndpoint, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        let mut attempts = 0u32;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!(%endpoint, attempts, "Endpoint not ready before deadline");
                return false;
            }
            attempts += 1;
            match self.probe_once(endpoint, self.probe_timeout.min(remaining)).await {
                Ok(()) => {
                    trace!(%endpoint, attempts, "Endpoint ready");
                    return true;
                }
                Err(e) => trace!(%endpoint, attempts, error = %e, "Readiness probe failed"),
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            sleep(self.backoff.min(remaining)).await;
        }
    }
}
