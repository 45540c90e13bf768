use crate::config::{Config, SpeedtestMode};
use crate::node::NodeRecord;
use crate::utils::error::Result;
use crate::utils::format::{format_ms, format_percent, format_speed};
use async_trait::async_trait;
use chrono::Local;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const SHARE_LINK_EXTENSION: &str = "originalUrl.txt";

/// Durable store for finished nodes.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Persist `node`. Returns `true` when a detailed row was written.
    async fn record_result(&self, node: &NodeRecord) -> Result<bool>;
}

/// Decides whether a node carries enough data to be written as a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistPolicy {
    pub site_ping_enabled: bool,
    pub download_enabled: bool,
}

impl PersistPolicy {
    pub fn from_config(config: &Config) -> Self {
        let mode = config.general.speedtest_mode;
        Self {
            site_ping_enabled: config.general.test_site_ping,
            download_enabled: mode != SpeedtestMode::PingOnly,
        }
    }

    /// At least one successful site ping, or downloaded bytes.
    pub fn is_persistable(&self, node: &NodeRecord) -> bool {
        let results = &node.results;
        let has_site_ping =
            self.site_ping_enabled && results.raw_site_ping.as_slice().iter().any(|&v| v > 0);
        let has_download = self.download_enabled && results.total_recv_bytes > 0;
        has_site_ping || has_download
    }
}

/// `<stem>.originalUrl.txt` next to the result file.
pub fn share_link_path(result_path: &Path) -> PathBuf {
    result_path.with_extension(SHARE_LINK_EXTENSION)
}

/// Render one node as a `[proto|server|port]` section.
pub fn render_section(node: &NodeRecord) -> String {
    let r = &node.results;
    let mut out = String::with_capacity(512);
    let _ = writeln!(out, "[{}]", node.section_key());
    let _ = writeln!(out, "Remarks={}", node.remarks);
    let _ = writeln!(out, "AvgPing={}", format_ms(r.avg_ping_ms));
    let _ = writeln!(out, "PkLoss={}", format_percent(r.packet_loss));
    let _ = writeln!(out, "SitePing={}", format_ms(r.site_ping_ms));
    let _ = writeln!(out, "AvgSpeed={}", format_speed(r.avg_speed));
    let _ = writeln!(out, "MaxSpeed={}", format_speed(r.max_speed));
    let _ = writeln!(out, "ULSpeed={}", format_speed(r.upload_speed));
    let _ = writeln!(out, "UsedTraffic={}", r.total_recv_bytes);
    let _ = writeln!(out, "GroupID={}", node.group_id);
    let _ = writeln!(out, "ID={}", node.id);
    let _ = writeln!(out, "Online={}", r.online);
    let _ = writeln!(out, "RawPing={}", r.raw_ping.join());
    let _ = writeln!(out, "RawSitePing={}", r.raw_site_ping.join());
    let _ = writeln!(out, "RawSpeed={}", r.raw_speed.join());
    let _ = writeln!(out, "NatType={}", r.nat_type);
    if let Some(geo) = r.outbound_geoip.as_ref().filter(|g| !g.country_code.is_empty()) {
        let _ = writeln!(out, "OutboundCountryCode={}", geo.country_code);
    }
    let _ = writeln!(out, "CompletedSeq={}", r.completed_seq);
    let _ = writeln!(out, "CompletedMs={}", r.completed_ms);
    out.push('\n');
    out
}

/// Append-only result file with a `[Basic]` header block.
pub struct FileResultSink {
    path: PathBuf,
    share_links: Option<PathBuf>,
    tester_name: String,
    policy: PersistPolicy,
    lock: Mutex<()>,
}

impl FileResultSink {
    pub fn new(path: PathBuf, tester_name: &str, policy: PersistPolicy, export_share_links: bool) -> Self {
        let share_links = export_share_links.then(|| share_link_path(&path));
        Self {
            path,
            share_links,
            tester_name: tester_name.to_string(),
            policy,
            lock: Mutex::new(()),
        }
    }

    /// Open a fresh `results/<YYYYMMDD-HHMMSS>.log` for this run.
    pub async fn create(config: &Config) -> Result<Self> {
        tokio::fs::create_dir_all(&config.results.dir).await?;
        let name = format!("{}.log", Local::now().format("%Y%m%d-%H%M%S"));
        let path = config.results.dir.join(name);
        info!(path = %path.display(), "Writing results");
        Ok(Self::new(
            path,
            &config.results.tester_name,
            PersistPolicy::from_config(config),
            config.results.export_share_links,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn share_links_path(&self) -> Option<&Path> {
        self.share_links.as_deref()
    }

    fn render_header(&self) -> String {
        format!(
            "[Basic]\nTester={}\nGenerationTime={}\n\n",
            self.tester_name,
            Local::now().format("%Y-%m-%d %H:%M:%S")
        )
    }
}

async fn append(path: &Path, content: &str) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(content.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

#[async_trait]
impl ResultSink for FileResultSink {
    async fn record_result(&self, node: &NodeRecord) -> Result<bool> {
        if !self.policy.is_persistable(node) {
            debug!(node_id = node.id, "Node has no usable data, not writing a row");
            return Ok(false);
        }

        let _guard = self.lock.lock().await;

        let mut content = String::new();
        if !tokio::fs::try_exists(&self.path).await? {
            content.push_str(&self.render_header());
        }
        content.push_str(&render_section(node));
        append(&self.path, &content).await?;

        if let (Some(path), Some(link)) = (&self.share_links, &node.original_share_link) {
            if !link.is_empty() {
                if let Err(e) = append(path, &format!("{}\n", link)).await {
                    warn!(node_id = node.id, error = %e, "Failed to append share link");
                }
            }
        }

        debug!(node_id = node.id, path = %self.path.display(), "Result recorded");
        Ok(true)
    }
}
