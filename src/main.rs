use anyhow::Context;
use clap::Parser;
use stairspeed::batch::{BatchRunner, PortAllocator, ShardPlan, ShardRuntime, ShardTimings};
use stairspeed::client::{terminate_by_name, ClientKind, ClientPaths, ClientSupervisor, ProcessRegistry};
use stairspeed::config::{Config, SpeedtestMode};
use stairspeed::lookup::{DisabledGeoIp, DisabledNat, GeoIpLookup, HttpGeoIp, NatTypeLookup, StunNatProbe};
use stairspeed::node::{apply_custom_group, dedup_by_endpoint, load_node_list, renumber};
use stairspeed::probe::{HttpClient, ReadinessProber, TestFileSelector};
use stairspeed::results::{Completion, FileResultSink, LogNotifier, NodeEventHistory, NodeNotifier};
use stairspeed::tester::{NetworkProbes, NodeTester, TesterSettings};
use stairspeed::utils::system::check_host_limits;
use stairspeed::SpeedtestError;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const EVENT_HISTORY_SIZE: usize = 4096;

#[derive(Parser, Debug)]
#[command(name = "StairSpeed")]
#[command(about = "Benchmark proxy nodes through local proxy clients", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Parsed node list (JSON array)
    #[arg(short, long, value_name = "FILE", required_unless_present = "generate_config")]
    nodes: Option<PathBuf>,

    /// Speedtest mode: all, pingonly or speedonly (overrides config)
    #[arg(long)]
    mode: Option<SpeedtestMode>,

    /// Put every node in this group (overrides config)
    #[arg(long)]
    group: Option<String>,

    /// Resolve NAT and GeoIP lookups before reporting each node
    #[arg(long)]
    interactive: bool,

    /// Generate example configuration file
    #[arg(long, value_name = "FILE")]
    generate_config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); defaults to [logging].level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(config_path) = args.generate_config {
        println!("Generating example configuration file: {:?}", config_path);
        Config::create_example(&config_path)?;
        println!("Example configuration file created successfully!");
        println!(
            "Edit the file and run: stairspeed --config {:?} --nodes nodes.json",
            config_path
        );
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(mode) = args.mode {
        config.general.speedtest_mode = mode;
    }
    if let Some(group) = args.group {
        config.general.custom_group = Some(group);
    }
    if args.interactive {
        config.general.interactive = true;
    }
    config.validate()?;

    let level = args
        .log_level
        .unwrap_or_else(|| config.logging.level.clone());
    init_logging(&level, &config.logging.format)?;

    info!("StairSpeed v{} starting", env!("CARGO_PKG_VERSION"));
    match &args.config {
        Some(path) => info!("Loaded configuration from: {:?}", path),
        None => info!("No configuration file specified, using defaults"),
    }

    let nodes_path = args
        .nodes
        .context("--nodes is required unless --generate-config is given")?;
    let mut nodes = dedup_by_endpoint(load_node_list(&nodes_path).await?);
    renumber(&mut nodes);
    if let Some(group) = &config.general.custom_group {
        apply_custom_group(&mut nodes, group);
    }

    let paths = ClientPaths::new(&config.clients.dir);
    for (kind, present) in paths.detect() {
        if present {
            debug!(client = %kind, "Found client binary");
        } else {
            warn!(client = %kind, path = %paths.binary(kind).display(), "Client binary not found");
        }
    }
    if config.clients.kill_stray_on_start {
        for kind in ClientKind::ALL {
            terminate_by_name(kind.binary_name());
        }
    }

    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(0);
    let plan = ShardPlan::resolve(&config.batch, nodes.len().max(1), cpus);
    check_host_limits(
        config.batch.base_port,
        plan.shard_size,
        plan.concurrency,
        config.download.thread_count,
    );

    let registry = ProcessRegistry::new();
    let _guard = registry.guard();
    spawn_signal_handler(Arc::clone(&registry));

    let supervisor = Arc::new(ClientSupervisor::new(
        paths,
        config.clients.launch_mode,
        Duration::from_millis(config.clients.validate_timeout_ms),
        Arc::clone(&registry),
    ));
    let readiness = Arc::new(ReadinessProber::from_config(&config.probe));

    let settings = Arc::new(TesterSettings::from_config(&config)?);
    let http = HttpClient::new(settings.socket_timeout)?;

    let geoip: Arc<dyn GeoIpLookup> = if config.general.test_geoip {
        Arc::new(HttpGeoIp::new(
            http.clone(),
            &config.lookup.geoip_api,
            Duration::from_millis(config.lookup.geoip_timeout_ms),
        ))
    } else {
        Arc::new(DisabledGeoIp)
    };
    let nat: Arc<dyn NatTypeLookup> = if config.general.test_nat_type {
        Arc::new(StunNatProbe::new(Duration::from_millis(
            config.lookup.nat_timeout_ms,
        )))
    } else {
        Arc::new(DisabledNat)
    };
    let selector = Arc::new(TestFileSelector::new(
        &config.download.test_file,
        &config.rules,
    )?);

    let tester = Arc::new(NodeTester::new(
        Arc::clone(&settings),
        Arc::new(NetworkProbes::new(http, Arc::clone(&settings))),
        geoip,
        nat,
        selector,
    ));

    let sink = Arc::new(FileResultSink::create(&config).await?);
    let result_path = sink.path().to_path_buf();
    let history = Arc::new(NodeEventHistory::new(EVENT_HISTORY_SIZE));
    let notifiers: Vec<Arc<dyn NodeNotifier>> = vec![Arc::new(LogNotifier), history.clone()];
    let completion = Completion::new(notifiers, sink);

    let runtime = ShardRuntime {
        launcher: supervisor,
        readiness,
        allocator: PortAllocator::new(config.batch.base_port, config.batch.reserved_port),
        timings: ShardTimings::from_config(&config.probe),
    };
    let runner = BatchRunner::new(
        runtime,
        tester,
        completion,
        config.batch.clone(),
        Duration::from_millis(config.probe.legacy_ready_timeout_ms),
    );

    let report = runner.batch_test(nodes).await;

    let failed = history.failed_count().await;
    info!(
        path = %result_path.display(),
        online = report.summary.online,
        failed,
        total = report.summary.total,
        "Results written"
    );

    Ok(())
}

/// Kill every tracked client before the process exits on ctrl-c or SIGTERM.
fn spawn_signal_handler(registry: Arc<ProcessRegistry>) {
    tokio::spawn(async move {
        wait_for_shutdown().await;
        warn!("Received shutdown signal, killing clients...");
        registry.terminate_all();
        std::process::exit(130);
    });
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM, handling ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_logging(level: &str, format: &str) -> stairspeed::Result<()> {
    let env_filter = EnvFilter::try_new(level)
        .map_err(|e| SpeedtestError::Config(format!("Invalid log level: {}", e)))?;

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    Ok(())
}
