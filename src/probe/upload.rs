use super::download::DownloadSession;
use super::http::{HttpClient, HttpTarget};
use crate::protocol::ProxyEndpoint;
use crate::utils::error::Result;
use rand::RngCore;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, trace};

/// Declared body size; the upload is cut off long before it completes.
pub const UPLOAD_CONTENT_LENGTH: u64 = 134_217_728;

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct UploadOutcome {
    pub total_bytes: u64,
    /// Bytes per second, `None` when nothing was sent.
    pub speed: Option<f64>,
}

/// Stream random data to `target` for at most `max_ticks` intervals.
pub async fn run_upload(
    client: &HttpClient,
    proxy: &ProxyEndpoint,
    target: &HttpTarget,
    tick: Duration,
    max_ticks: usize,
) -> UploadOutcome {
    let session = DownloadSession::new();
    let mut chunk = vec![0u8; CHUNK_SIZE];
    rand::thread_rng().fill_bytes(&mut chunk);

    let worker = {
        let guard = session.enter_worker();
        let session = session.clone();
        let client = client.clone();
        let proxy = proxy.clone();
        let target = target.clone();
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = upload_worker(&client, &proxy, &target, &session, &chunk).await {
                trace!(error = %e, "Upload worker exited");
            }
        })
    };

    let started = Instant::now();
    let mut ticker = interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    for _ in 0..max_ticks {
        ticker.tick().await;
        if session.running_workers() == 0 {
            break;
        }
    }
    let elapsed = started.elapsed();
    session.cancel();
    worker.abort();

    let total_bytes = session.total_bytes();
    let speed = if total_bytes > 0 {
        Some(total_bytes as f64 * 1000.0 / (elapsed.as_millis() as f64 + 1.0))
    } else {
        None
    };
    debug!(%proxy, total_bytes, ?speed, "Upload sampling finished");
    UploadOutcome { total_bytes, speed }
}

async fn upload_worker(
    client: &HttpClient,
    proxy: &ProxyEndpoint,
    target: &HttpTarget,
    session: &DownloadSession,
    chunk: &[u8],
) -> Result<()> {
    let mut io = client.open(Some(proxy), target).await?;
    io.write_all(target.post_request(UPLOAD_CONTENT_LENGTH).as_bytes())
        .await?;

    let mut sent = 0u64;
    while sent < UPLOAD_CONTENT_LENGTH {
        let n = (UPLOAD_CONTENT_LENGTH - sent).min(chunk.len() as u64) as usize;
        tokio::select! {
            _ = session.token().cancelled() => return Ok(()),
            res = io.write_all(&chunk[..n]) => res?,
        }
        sent += n as u64;
        session.add_bytes(n as u64);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_upload_is_not_measured() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = HttpClient::new(Duration::from_millis(300)).unwrap();
        let target = HttpTarget::parse("http://example.com/upload").unwrap();

        let outcome = run_upload(
            &client,
            &ProxyEndpoint::local_socks(port),
            &target,
            Duration::from_millis(50),
            10,
        )
        .await;
        assert_eq!(outcome.total_bytes, 0);
        assert_eq!(outcome.speed, None);
    }
}
