/// Whole-run tests: real tester, supervisor and file sink against
/// in-process SOCKS5 and HTTP fakes.
mod common;

use common::{closed_port, spawn_http_server, spawn_socks5_server};
use stairspeed::batch::{BatchRunner, PortAllocator, ShardRuntime, ShardTimings};
use stairspeed::client::{ClientPaths, ClientSupervisor, ProcessRegistry};
use stairspeed::config::{Config, LaunchMode, SpeedtestMode};
use stairspeed::lookup::{DisabledGeoIp, DisabledNat};
use stairspeed::node::{LinkType, NodeRecord, TestOutcome};
use stairspeed::probe::{HttpClient, ReadinessProber, TestFileSelector};
use stairspeed::results::{Completion, FileResultSink, NodeEventHistory, NodeNotifier, PersistPolicy};
use stairspeed::tester::{NetworkProbes, NodeTester, TesterSettings};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn test_config(http: SocketAddr, clients_dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.general.test_nat_type = false;
    config.general.test_geoip = false;
    config.probe.tcp_ping_count = 2;
    config.probe.tcp_ping_timeout_ms = 300;
    config.probe.site_ping_url = format!("http://127.0.0.1:{}/ping", http.port());
    config.probe.site_ping_count = 2;
    config.probe.site_ping_timeout_ms = 1000;
    config.probe.legacy_ready_timeout_ms = 300;
    config.download.test_file = format!("http://127.0.0.1:{}/file", http.port());
    config.download.thread_count = 2;
    config.download.interval_ms = 100;
    config.download.max_bytes = 256 * 1024;
    config.download.stable_window = 0;
    config.download.socket_timeout_ms = 2000;
    config.clients.dir = clients_dir.to_path_buf();
    config.clients.launch_mode = LaunchMode::File;
    config.batch.base_port = 47600;
    config
}

struct Harness {
    runner: BatchRunner,
    sink: Arc<FileResultSink>,
    history: Arc<NodeEventHistory>,
}

fn harness(config: &Config, results_dir: &std::path::Path) -> Harness {
    let registry = ProcessRegistry::new();
    let supervisor = Arc::new(ClientSupervisor::new(
        ClientPaths::new(&config.clients.dir),
        config.clients.launch_mode,
        Duration::from_secs(1),
        registry,
    ));

    let settings = Arc::new(TesterSettings::from_config(config).unwrap());
    let http = HttpClient::new(settings.socket_timeout).unwrap();
    let tester = Arc::new(NodeTester::new(
        Arc::clone(&settings),
        Arc::new(NetworkProbes::new(http, Arc::clone(&settings))),
        Arc::new(DisabledGeoIp),
        Arc::new(DisabledNat),
        Arc::new(TestFileSelector::new(&config.download.test_file, &config.rules).unwrap()),
    ));

    let sink = Arc::new(FileResultSink::new(
        results_dir.join("run.log"),
        "StairSpeed test",
        PersistPolicy::from_config(config),
        true,
    ));
    let history = Arc::new(NodeEventHistory::new(64));
    let notifiers: Vec<Arc<dyn NodeNotifier>> = vec![history.clone()];
    let completion = Completion::new(notifiers, sink.clone());

    let runtime = ShardRuntime {
        launcher: supervisor,
        readiness: Arc::new(ReadinessProber::from_config(&config.probe)),
        allocator: PortAllocator::new(config.batch.base_port, None),
        timings: ShardTimings::from_config(&config.probe),
    };
    let runner = BatchRunner::new(
        runtime,
        tester,
        completion,
        config.batch.clone(),
        Duration::from_millis(config.probe.legacy_ready_timeout_ms),
    );

    Harness {
        runner,
        sink,
        history,
    }
}

fn socks_node(id: u32, port: u16) -> NodeRecord {
    let mut node = NodeRecord::new(id, LinkType::Socks, "127.0.0.1", port, "");
    node.remarks = format!("socks-{}", id);
    node.original_share_link = Some(format!("socks://127.0.0.1:{}#socks-{}", port, id));
    node
}

#[tokio::test]
async fn test_mixed_run_writes_only_usable_rows() {
    let (socks, _) = spawn_socks5_server().await;
    let http = spawn_http_server().await;
    let clients = TempDir::new().unwrap();
    let results = TempDir::new().unwrap();
    let config = test_config(http, clients.path());
    let h = harness(&config, results.path());

    let dead = closed_port().await;
    let nodes = vec![
        socks_node(0, socks.port()),
        socks_node(1, dead),
        NodeRecord::new(2, LinkType::Trojan, "t.example", 443, "{}"),
    ];

    let report = h.runner.batch_test(nodes).await;

    assert_eq!(report.summary.total, 3);
    assert_eq!(report.summary.online, 1);

    let live = &report.nodes[0];
    assert!(live.results.online);
    assert_eq!(live.results.outcome, Some(TestOutcome::Success));
    assert!(live.results.total_recv_bytes >= 256 * 1024);
    assert!(live.results.avg_speed.is_some());
    assert_eq!(live.results.raw_site_ping.len(), 2);

    assert_eq!(report.nodes[1].results.outcome, Some(TestOutcome::NoConnection));
    // no trojan binary in the clients dir
    assert_eq!(report.nodes[2].results.outcome, Some(TestOutcome::ClientStartup));

    let content = tokio::fs::read_to_string(h.sink.path()).await.unwrap();
    assert!(content.starts_with("[Basic]\nTester=StairSpeed test\n"));
    assert_eq!(content.matches("[Basic]").count(), 1);
    assert!(content.contains(&format!("[socks|127.0.0.1|{}]", socks.port())));
    assert!(content.contains("Remarks=socks-0\n"));
    assert!(content.contains("Online=true\n"));
    assert!(!content.contains(&format!("|{}]", dead)));
    assert!(!content.contains("[trojan|"));

    let links = tokio::fs::read_to_string(h.sink.share_links_path().unwrap())
        .await
        .unwrap();
    assert_eq!(links.lines().count(), 1);

    // every node was pushed exactly once, failures included
    assert_eq!(h.history.len().await, 3);
}

#[tokio::test]
async fn test_pingonly_run_skips_download() {
    let (socks, _) = spawn_socks5_server().await;
    let http = spawn_http_server().await;
    let clients = TempDir::new().unwrap();
    let results = TempDir::new().unwrap();
    let mut config = test_config(http, clients.path());
    config.general.speedtest_mode = SpeedtestMode::PingOnly;
    let h = harness(&config, results.path());

    let report = h.runner.batch_test(vec![socks_node(0, socks.port())]).await;

    let node = &report.nodes[0];
    assert!(node.results.online);
    assert_eq!(node.results.total_recv_bytes, 0);
    assert!(node.results.raw_speed.is_empty());

    let content = tokio::fs::read_to_string(h.sink.path()).await.unwrap();
    assert!(content.contains("AvgSpeed=N/A\n"));
}
