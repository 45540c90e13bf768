/// Probe primitives against in-process SOCKS5 and HTTP fakes.
mod common;

use common::{closed_port, spawn_http_server, spawn_socks5_server};
use stairspeed::probe::{
    run_download, site_ping, tcp_ping, HttpClient, HttpTarget, ReadinessCheck, ReadinessProber,
    SamplerLimits, StopReason,
};
use stairspeed::protocol::ProxyEndpoint;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

fn limits(max_bytes: u64) -> SamplerLimits {
    SamplerLimits {
        interval: Duration::from_millis(100),
        max_ticks: 20,
        max_bytes,
        stable_window: 0,
        stable_tolerance: 0.05,
        slow_abort_ticks: 20,
        slow_abort_bytes: 0,
    }
}

#[tokio::test]
async fn test_readiness_detects_live_socks_inbound() {
    let (socks, _) = spawn_socks5_server().await;
    let prober = ReadinessProber::new(Duration::from_millis(300), Duration::from_millis(50));

    let ready = prober
        .wait_ready(&ProxyEndpoint::local_socks(socks.port()), Duration::from_secs(1))
        .await;
    assert!(ready);
}

#[tokio::test]
async fn test_readiness_gives_up_within_bound() {
    let port = closed_port().await;
    let probe_timeout = Duration::from_millis(200);
    let limit = Duration::from_millis(600);
    let prober = ReadinessProber::new(probe_timeout, Duration::from_millis(50));

    let started = Instant::now();
    let ready = prober
        .wait_ready(&ProxyEndpoint::local_socks(port), limit)
        .await;

    assert!(!ready);
    // timeout plus one probe, with slack for the scheduler
    assert!(started.elapsed() < limit + probe_timeout + Duration::from_millis(300));
}

#[tokio::test]
async fn test_tcp_ping_counts_losses() {
    let (socks, _) = spawn_socks5_server().await;
    let report = tcp_ping("127.0.0.1", socks.port(), 4, Duration::from_millis(500))
        .await
        .unwrap();
    assert_eq!(report.samples.len(), 4);
    assert_eq!(report.loss(), 0.0);

    let port = closed_port().await;
    let report = tcp_ping("127.0.0.1", port, 3, Duration::from_millis(300))
        .await
        .unwrap();
    assert_eq!(report.loss(), 1.0);
}

#[tokio::test]
async fn test_site_ping_through_proxy() {
    let (socks, connects) = spawn_socks5_server().await;
    let http = spawn_http_server().await;
    let client = HttpClient::new(Duration::from_secs(2)).unwrap();
    let target = HttpTarget::parse(&format!("http://127.0.0.1:{}/ping", http.port())).unwrap();

    let report = site_ping(
        &client,
        &ProxyEndpoint::local_socks(socks.port()),
        &target,
        3,
        2,
        Duration::from_secs(2),
    )
    .await;

    assert!(report.any_success());
    assert_eq!(report.samples.len(), 3);
    assert!(report.samples.iter().all(|&ms| ms > 0));
    assert_eq!(connects.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_site_ping_stops_after_consecutive_failures() {
    let (socks, _) = spawn_socks5_server().await;
    let client = HttpClient::new(Duration::from_millis(500)).unwrap();
    let dead = closed_port().await;
    let target = HttpTarget::parse(&format!("http://127.0.0.1:{}/ping", dead)).unwrap();

    let report = site_ping(
        &client,
        &ProxyEndpoint::local_socks(socks.port()),
        &target,
        10,
        2,
        Duration::from_millis(500),
    )
    .await;

    assert!(!report.any_success());
    assert_eq!(report.samples.len(), 2);
}

#[tokio::test]
async fn test_download_stops_at_byte_cap() {
    let (socks, _) = spawn_socks5_server().await;
    let http = spawn_http_server().await;
    let client = HttpClient::new(Duration::from_secs(2)).unwrap();
    let target = HttpTarget::parse(&format!("http://127.0.0.1:{}/file", http.port())).unwrap();
    let cap = 512 * 1024;

    let outcome = run_download(
        &client,
        &ProxyEndpoint::local_socks(socks.port()),
        &target,
        2,
        limits(cap),
        Duration::from_secs(2),
    )
    .await;

    assert_eq!(outcome.stop, StopReason::ByteCap);
    assert!(outcome.total_bytes >= cap);
    assert!(!outcome.samples.is_empty());
    assert!(outcome.samples.len() < 20);
    assert!(outcome.max_speed > 0);
}

#[tokio::test]
async fn test_download_of_missing_file_reports_zero() {
    let (socks, _) = spawn_socks5_server().await;
    let http = spawn_http_server().await;
    let client = HttpClient::new(Duration::from_secs(2)).unwrap();
    let target = HttpTarget::parse(&format!("http://127.0.0.1:{}/missing", http.port())).unwrap();

    let outcome = run_download(
        &client,
        &ProxyEndpoint::local_socks(socks.port()),
        &target,
        2,
        limits(1024 * 1024),
        Duration::from_secs(2),
    )
    .await;

    assert_eq!(outcome.total_bytes, 0);
    assert_eq!(outcome.stop, StopReason::WorkersDone);
}
