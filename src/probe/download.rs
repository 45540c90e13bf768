use super::http::{HttpClient, HttpTarget};
use super::sampler::{SamplerLimits, SpeedSampler, StopReason};
use crate::config::MAX_SPEED_SAMPLES;
use crate::node::SampleBuffer;
use crate::protocol::ProxyEndpoint;
use crate::utils::error::{Result, SpeedtestError};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Counters shared by the workers of one download test and nothing else.
#[derive(Debug, Clone, Default)]
pub struct DownloadSession {
    bytes: Arc<AtomicU64>,
    running: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl DownloadSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn running_workers(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Mark a worker as running until the returned guard drops.
    pub fn enter_worker(&self) -> WorkerGuard {
        self.running.fetch_add(1, Ordering::AcqRel);
        WorkerGuard {
            running: Arc::clone(&self.running),
        }
    }
}

pub struct WorkerGuard {
    running: Arc<AtomicUsize>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.running.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub total_bytes: u64,
    pub samples: SampleBuffer<u64, MAX_SPEED_SAMPLES>,
    pub avg_speed: f64,
    pub max_speed: u64,
    pub stop: StopReason,
    pub elapsed: Duration,
}

/// Drive `threads` download workers and sample their combined throughput.
pub async fn run_download(
    client: &HttpClient,
    proxy: &ProxyEndpoint,
    target: &HttpTarget,
    threads: usize,
    limits: SamplerLimits,
    socket_timeout: Duration,
) -> DownloadOutcome {
    let session = DownloadSession::new();
    let mut workers = JoinSet::new();
    for worker_id in 0..threads.max(1) {
        let guard = session.enter_worker();
        let session = session.clone();
        let client = client.clone();
        let proxy = proxy.clone();
        let target = target.clone();
        workers.spawn(async move {
            let _guard = guard;
            if let Err(e) = download_worker(&client, &proxy, &target, &session, socket_timeout).await {
                trace!(worker_id, error = %e, "Download worker exited");
            }
        });
    }

    let started = Instant::now();
    let mut ticker = interval(limits.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    let mut sampler = SpeedSampler::new(limits);
    let stop = loop {
        ticker.tick().await;
        if let Some(reason) = sampler.tick(session.total_bytes(), session.running_workers()) {
            break reason;
        }
    };
    let elapsed = started.elapsed();

    session.cancel();
    if timeout(Duration::from_secs(1), async {
        while workers.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        workers.abort_all();
    }

    let total_bytes = session.total_bytes();
    debug!(%proxy, total_bytes, ?stop, elapsed_ms = elapsed.as_millis() as u64, "Download sampling finished");
    DownloadOutcome {
        total_bytes,
        samples: sampler.samples().clone(),
        avg_speed: SpeedSampler::average_speed(total_bytes, elapsed),
        max_speed: sampler.max_speed(),
        stop,
        elapsed,
    }
}

/// Fetch the test file repeatedly until cancelled or a request fails.
async fn download_worker(
    client: &HttpClient,
    proxy: &ProxyEndpoint,
    target: &HttpTarget,
    session: &DownloadSession,
    socket_timeout: Duration,
) -> Result<()> {
    let mut buf = vec![0u8; 32 * 1024];
    loop {
        let (mut io, head) = tokio::select! {
            _ = session.token().cancelled() => return Ok(()),
            res = client.get(Some(proxy), target) => res?,
        };
        if !head.is_success() {
            return Err(SpeedtestError::Http(format!("test file returned {}", head.status)));
        }
        session.add_bytes(head.body_prefix.len() as u64);

        loop {
            let n = tokio::select! {
                _ = session.token().cancelled() => return Ok(()),
                res = timeout(socket_timeout, io.read(&mut buf)) => {
                    res.map_err(|_| SpeedtestError::timeout("download read"))??
                }
            };
            if n == 0 {
                break;
            }
            session.add_bytes(n as u64);
        }
    }
}
