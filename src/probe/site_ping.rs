use super::http::{HttpClient, HttpTarget};
use crate::protocol::ProxyEndpoint;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::trace;

/// Latency samples of repeated requests through the proxy. Failed
/// requests are recorded as 0.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SitePingReport {
    pub samples: Vec<u32>,
}

impl SitePingReport {
    pub fn any_success(&self) -> bool {
        self.samples.iter().any(|&s| s > 0)
    }

    pub fn average_ms(&self) -> f64 {
        let ok: Vec<u32> = self.samples.iter().copied().filter(|&s| s > 0).collect();
        if ok.is_empty() {
            return 0.0;
        }
        ok.iter().map(|&s| s as f64).sum::<f64>() / ok.len() as f64
    }
}

/// Up to `count` requests, giving up after `fail_limit` consecutive failures.
pub async fn site_ping(
    client: &HttpClient,
    proxy: &ProxyEndpoint,
    target: &HttpTarget,
    count: usize,
    fail_limit: usize,
    limit: Duration,
) -> SitePingReport {
    let mut report = SitePingReport {
        samples: Vec::with_capacity(count),
    };
    let mut consecutive_failures = 0;

    for attempt in 0..count {
        let started = Instant::now();
        let outcome = timeout(limit, client.get(Some(proxy), target)).await;
        let sample = match outcome {
            Ok(Ok(_)) => {
                consecutive_failures = 0;
                started.elapsed().as_millis().max(1) as u32
            }
            Ok(Err(e)) => {
                trace!(%proxy, attempt, error = %e, "Site ping failed");
                consecutive_failures += 1;
                0
            }
            Err(_) => {
                trace!(%proxy, attempt, "Site ping timed out");
                consecutive_failures += 1;
                0
            }
        };
        report.samples.push(sample);
        if consecutive_failures >= fail_limit {
            break;
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_ignores_failures() {
        let report = SitePingReport {
            samples: vec![100, 0, 200, 0],
        };
        assert!(report.any_success());
        assert_eq!(report.average_ms(), 150.0);

        let empty = SitePingReport {
            samples: vec![0, 0],
        };
        assert!(!empty.any_success());
        assert_eq!(empty.average_ms(), 0.0);
    }

    #[tokio::test]
    async fn test_stops_after_consecutive_failures() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = HttpClient::new(Duration::from_millis(300)).unwrap();
        let target = HttpTarget::parse("http://example.com/").unwrap();

        let report = site_ping(
            &client,
            &ProxyEndpoint::local_socks(port),
            &target,
            10,
            2,
            Duration::from_millis(500),
        )
        .await;
        assert_eq!(report.samples, vec![0, 0]);
    }
}
