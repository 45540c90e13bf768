use crate::utils::error::{Result, SpeedtestError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Hard capacity of the per-node sample buffers.
pub const MAX_TCP_PINGS: usize = 6;
pub const MAX_SITE_PINGS: usize = 10;
pub const MAX_SPEED_SAMPLES: usize = 20;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub clients: ClientsConfig,
    #[serde(default)]
    pub results: ResultsConfig,
    #[serde(default)]
    pub lookup: LookupConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedtestMode {
    All,
    PingOnly,
    SpeedOnly,
}

impl std::str::FromStr for SpeedtestMode {
    type Err = SpeedtestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(SpeedtestMode::All),
            "pingonly" => Ok(SpeedtestMode::PingOnly),
            "speedonly" => Ok(SpeedtestMode::SpeedOnly),
            other => Err(SpeedtestError::Config(format!(
                "Invalid speedtest mode: {}. Must be 'all', 'pingonly' or 'speedonly'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_speedtest_mode")]
    pub speedtest_mode: SpeedtestMode,
    #[serde(default = "default_true")]
    pub test_site_ping: bool,
    #[serde(default)]
    pub test_upload: bool,
    #[serde(default = "default_true")]
    pub test_nat_type: bool,
    #[serde(default = "default_true")]
    pub test_geoip: bool,
    /// Interactive runs wait for NAT/GeoIP before a node is reported.
    #[serde(default)]
    pub interactive: bool,
    #[serde(default)]
    pub custom_group: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_tcp_ping_count")]
    pub tcp_ping_count: usize,
    #[serde(default = "default_tcp_ping_timeout_ms")]
    pub tcp_ping_timeout_ms: u64,
    #[serde(default = "default_site_ping_url")]
    pub site_ping_url: String,
    #[serde(default = "default_site_ping_count")]
    pub site_ping_count: usize,
    #[serde(default = "default_site_ping_fail_limit")]
    pub site_ping_fail_limit: usize,
    #[serde(default = "default_site_ping_timeout_ms")]
    pub site_ping_timeout_ms: u64,
    #[serde(default = "default_readiness_probe_timeout_ms")]
    pub readiness_probe_timeout_ms: u64,
    #[serde(default = "default_readiness_backoff_ms")]
    pub readiness_backoff_ms: u64,
    #[serde(default = "default_legacy_ready_timeout_ms")]
    pub legacy_ready_timeout_ms: u64,
    #[serde(default = "default_shard_ready_timeout_ms")]
    pub shard_ready_timeout_ms: u64,
    #[serde(default = "default_isolation_ready_timeout_ms")]
    pub isolation_ready_timeout_ms: u64,
    #[serde(default = "default_shard_settle_ms")]
    pub shard_settle_ms: u64,
    /// Pause after killing a client, before its ports are reused.
    #[serde(default = "default_teardown_settle_ms")]
    pub teardown_settle_ms: u64,
}

/// Download sampling knobs. Every early-stop threshold is tunable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    #[serde(default = "default_test_file")]
    pub test_file: String,
    #[serde(default = "default_thread_count")]
    pub thread_count: usize,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_max_ticks")]
    pub max_ticks: usize,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_stable_window")]
    pub stable_window: usize,
    #[serde(default = "default_stable_tolerance")]
    pub stable_tolerance: f64,
    #[serde(default = "default_slow_abort_ticks")]
    pub slow_abort_ticks: usize,
    #[serde(default = "default_slow_abort_bytes")]
    pub slow_abort_bytes: u64,
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_upload_url")]
    pub url: String,
    #[serde(default = "default_upload_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_upload_max_ticks")]
    pub max_ticks: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    /// Port of the harness itself; never handed to a client.
    #[serde(default)]
    pub reserved_port: Option<u16>,
    /// Non-positive means "use parallel_threshold".
    #[serde(default = "default_shard_size")]
    pub shard_size: i64,
    /// Non-positive means "use worker_count or twice the CPU count".
    #[serde(default = "default_concurrency")]
    pub concurrency: i64,
    #[serde(default = "default_parallel_threshold")]
    pub parallel_threshold: usize,
    #[serde(default)]
    pub worker_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    File,
    Stdin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientsConfig {
    #[serde(default = "default_clients_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_launch_mode")]
    pub launch_mode: LaunchMode,
    #[serde(default = "default_validate_timeout_ms")]
    pub validate_timeout_ms: u64,
    /// Kill stray clients left over from a previous run at start-up.
    #[serde(default = "default_true")]
    pub kill_stray_on_start: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsConfig {
    #[serde(default = "default_results_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_tester_name")]
    pub tester_name: String,
    #[serde(default = "default_true")]
    pub export_share_links: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupConfig {
    #[serde(default = "default_geoip_api")]
    pub geoip_api: String,
    #[serde(default = "default_lookup_timeout_ms")]
    pub geoip_timeout_ms: u64,
    #[serde(default = "default_stun_server")]
    pub stun_server: String,
    #[serde(default = "default_stun_port")]
    pub stun_port: u16,
    #[serde(default = "default_lookup_timeout_ms")]
    pub nat_timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesConfig {
    #[serde(default)]
    pub test_files: Vec<TestFileRule>,
    #[serde(default)]
    pub match_rules: Vec<MatchRule>,
}

/// Named download URL referenced by match rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestFileRule {
    pub tag: String,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    Group,
    Remarks,
    Server,
    Protocol,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRule {
    pub mode: MatchMode,
    /// Regular expressions; any match selects `tag`.
    pub patterns: Vec<String>,
    pub tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String, // "json" or "pretty"
}

// Default values
fn default_true() -> bool {
    true
}

fn default_speedtest_mode() -> SpeedtestMode {
    SpeedtestMode::All
}

fn default_tcp_ping_count() -> usize {
    MAX_TCP_PINGS
}

fn default_tcp_ping_timeout_ms() -> u64 {
    2000
}

fn default_site_ping_url() -> String {
    "https://www.google.com/".to_string()
}

fn default_site_ping_count() -> usize {
    MAX_SITE_PINGS
}

fn default_site_ping_fail_limit() -> usize {
    2
}

fn default_site_ping_timeout_ms() -> u64 {
    5000
}

fn default_readiness_probe_timeout_ms() -> u64 {
    700
}

fn default_readiness_backoff_ms() -> u64 {
    200
}

fn default_legacy_ready_timeout_ms() -> u64 {
    1000
}

fn default_shard_ready_timeout_ms() -> u64 {
    3000
}

fn default_isolation_ready_timeout_ms() -> u64 {
    2000
}

fn default_shard_settle_ms() -> u64 {
    300
}

fn default_teardown_settle_ms() -> u64 {
    200
}

fn default_test_file() -> String {
    "http://download.microsoft.com/download/2/0/E/20E90413-712F-438C-988E-FDAA79A8AC3D/dotnetfx35.exe"
        .to_string()
}

fn default_thread_count() -> usize {
    4
}

fn default_interval_ms() -> u64 {
    500
}

fn default_max_ticks() -> usize {
    10
}

fn default_max_bytes() -> u64 {
    2 * 1024 * 1024
}

fn default_stable_window() -> usize {
    4
}

fn default_stable_tolerance() -> f64 {
    0.08
}

fn default_slow_abort_ticks() -> usize {
    6
}

fn default_slow_abort_bytes() -> u64 {
    64 * 1024
}

fn default_socket_timeout_ms() -> u64 {
    5000
}

fn default_upload_url() -> String {
    "http://losangeles.speed.googlefiber.net:3004/upload?time=0".to_string()
}

fn default_upload_interval_ms() -> u64 {
    1000
}

fn default_upload_max_ticks() -> usize {
    10
}

fn default_base_port() -> u16 {
    32768
}

fn default_shard_size() -> i64 {
    1024
}

fn default_concurrency() -> i64 {
    256
}

fn default_parallel_threshold() -> usize {
    256
}

fn default_clients_dir() -> PathBuf {
    PathBuf::from("tools/clients")
}

fn default_launch_mode() -> LaunchMode {
    LaunchMode::Stdin
}

fn default_validate_timeout_ms() -> u64 {
    5000
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

fn default_tester_name() -> String {
    format!("StairSpeed {}", env!("CARGO_PKG_VERSION"))
}

fn default_geoip_api() -> String {
    "https://api.ip.sb/geoip".to_string()
}

fn default_lookup_timeout_ms() -> u64 {
    5000
}

fn default_stun_server() -> String {
    "stun.l.google.com".to_string()
}

fn default_stun_port() -> u16 {
    19302
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            speedtest_mode: default_speedtest_mode(),
            test_site_ping: true,
            test_upload: false,
            test_nat_type: true,
            test_geoip: true,
            interactive: false,
            custom_group: None,
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            tcp_ping_count: default_tcp_ping_count(),
            tcp_ping_timeout_ms: default_tcp_ping_timeout_ms(),
            site_ping_url: default_site_ping_url(),
            site_ping_count: default_site_ping_count(),
            site_ping_fail_limit: default_site_ping_fail_limit(),
            site_ping_timeout_ms: default_site_ping_timeout_ms(),
            readiness_probe_timeout_ms: default_readiness_probe_timeout_ms(),
            readiness_backoff_ms: default_readiness_backoff_ms(),
            legacy_ready_timeout_ms: default_legacy_ready_timeout_ms(),
            shard_ready_timeout_ms: default_shard_ready_timeout_ms(),
            isolation_ready_timeout_ms: default_isolation_ready_timeout_ms(),
            shard_settle_ms: default_shard_settle_ms(),
            teardown_settle_ms: default_teardown_settle_ms(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            test_file: default_test_file(),
            thread_count: default_thread_count(),
            interval_ms: default_interval_ms(),
            max_ticks: default_max_ticks(),
            max_bytes: default_max_bytes(),
            stable_window: default_stable_window(),
            stable_tolerance: default_stable_tolerance(),
            slow_abort_ticks: default_slow_abort_ticks(),
            slow_abort_bytes: default_slow_abort_bytes(),
            socket_timeout_ms: default_socket_timeout_ms(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            url: default_upload_url(),
            interval_ms: default_upload_interval_ms(),
            max_ticks: default_upload_max_ticks(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            base_port: default_base_port(),
            reserved_port: None,
            shard_size: default_shard_size(),
            concurrency: default_concurrency(),
            parallel_threshold: default_parallel_threshold(),
            worker_count: 0,
        }
    }
}

impl Default for ClientsConfig {
    fn default() -> Self {
        Self {
            dir: default_clients_dir(),
            launch_mode: default_launch_mode(),
            validate_timeout_ms: default_validate_timeout_ms(),
            kill_stray_on_start: true,
        }
    }
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            dir: default_results_dir(),
            tester_name: default_tester_name(),
            export_share_links: true,
        }
    }
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            geoip_api: default_geoip_api(),
            geoip_timeout_ms: default_lookup_timeout_ms(),
            stun_server: default_stun_server(),
            stun_port: default_stun_port(),
            nat_timeout_ms: default_lookup_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| SpeedtestError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| SpeedtestError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let probe = &self.probe;
        if probe.tcp_ping_count == 0 || probe.tcp_ping_count > MAX_TCP_PINGS {
            return Err(SpeedtestError::Config(format!(
                "probe.tcp_ping_count must be between 1 and {}",
                MAX_TCP_PINGS
            )));
        }
        if probe.site_ping_count == 0 || probe.site_ping_count > MAX_SITE_PINGS {
            return Err(SpeedtestError::Config(format!(
                "probe.site_ping_count must be between 1 and {}",
                MAX_SITE_PINGS
            )));
        }
        if probe.site_ping_fail_limit == 0 {
            return Err(SpeedtestError::Config(
                "probe.site_ping_fail_limit must be at least 1".to_string(),
            ));
        }
        if probe.readiness_probe_timeout_ms == 0 {
            return Err(SpeedtestError::Config(
                "probe.readiness_probe_timeout_ms must be positive".to_string(),
            ));
        }

        let dl = &self.download;
        if dl.thread_count == 0 {
            return Err(SpeedtestError::Config(
                "download.thread_count must be at least 1".to_string(),
            ));
        }
        if dl.interval_ms == 0 {
            return Err(SpeedtestError::Config(
                "download.interval_ms must be positive".to_string(),
            ));
        }
        if dl.max_ticks == 0 || dl.max_ticks > MAX_SPEED_SAMPLES {
            return Err(SpeedtestError::Config(format!(
                "download.max_ticks must be between 1 and {}",
                MAX_SPEED_SAMPLES
            )));
        }
        if !(dl.stable_tolerance > 0.0 && dl.stable_tolerance < 1.0) {
            return Err(SpeedtestError::Config(
                "download.stable_tolerance must be in (0, 1)".to_string(),
            ));
        }

        if self.upload.interval_ms == 0 || self.upload.max_ticks == 0 {
            return Err(SpeedtestError::Config(
                "upload.interval_ms and upload.max_ticks must be positive".to_string(),
            ));
        }

        for (name, value) in [
            ("probe.site_ping_url", &probe.site_ping_url),
            ("download.test_file", &dl.test_file),
            ("upload.url", &self.upload.url),
        ] {
            url::Url::parse(value)
                .map_err(|e| SpeedtestError::Config(format!("Invalid {}: {}", name, e)))?;
        }

        if self.batch.base_port == 0 {
            return Err(SpeedtestError::Config(
                "batch.base_port cannot be 0".to_string(),
            ));
        }

        for rule in &self.rules.match_rules {
            if !self.rules.test_files.iter().any(|t| t.tag == rule.tag) {
                return Err(SpeedtestError::Config(format!(
                    "Match rule references unknown test file tag: {}",
                    rule.tag
                )));
            }
            for pattern in &rule.patterns {
                regex::Regex::new(pattern).map_err(|e| {
                    SpeedtestError::Config(format!("Invalid match pattern '{}': {}", pattern, e))
                })?;
            }
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(SpeedtestError::Config(format!(
                "Invalid log format: {}. Must be 'pretty' or 'json'",
                self.logging.format
            )));
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example<P: AsRef<Path>>(path: P) -> Result<()> {
        let example = r#"[general]
speedtest_mode = "all"  # Options: "all", "pingonly", "speedonly"
test_site_ping = true
test_upload = false
test_nat_type = true
test_geoip = true
interactive = false
# custom_group = "My group"

[probe]
tcp_ping_count = 6
tcp_ping_timeout_ms = 2000
site_ping_url = "https://www.google.com/"
site_ping_count = 10
site_ping_fail_limit = 2
readiness_probe_timeout_ms = 700
readiness_backoff_ms = 200
legacy_ready_timeout_ms = 1000
shard_ready_timeout_ms = 3000
isolation_ready_timeout_ms = 2000
shard_settle_ms = 300
teardown_settle_ms = 200

[download]
test_file = "http://download.microsoft.com/download/2/0/E/20E90413-712F-438C-988E-FDAA79A8AC3D/dotnetfx35.exe"
thread_count = 4
interval_ms = 500
max_ticks = 10
max_bytes = 2097152
stable_window = 4
stable_tolerance = 0.08
slow_abort_ticks = 6
slow_abort_bytes = 65536
socket_timeout_ms = 5000

[upload]
url = "http://losangeles.speed.googlefiber.net:3004/upload?time=0"
interval_ms = 1000
max_ticks = 10

[batch]
base_port = 32768
shard_size = 1024     # <= 0: use parallel_threshold
concurrency = 256     # <= 0: use worker_count or 2 x CPU count
parallel_threshold = 256
worker_count = 0

[clients]
dir = "tools/clients"
launch_mode = "stdin"  # Options: "stdin", "file"
validate_timeout_ms = 5000
kill_stray_on_start = true

[results]
dir = "results"
export_share_links = true

[lookup]
geoip_api = "https://api.ip.sb/geoip"
stun_server = "stun.l.google.com"
stun_port = 19302

# [[rules.test_files]]
# tag = "cachefly"
# url = "http://cachefly.cachefly.net/10mb.test"
#
# [[rules.match_rules]]
# mode = "group"  # Options: "group", "remarks", "server", "protocol"
# patterns = ["^US"]
# tag = "cachefly"

[logging]
level = "info"  # Options: "trace", "debug", "info", "warn", "error"
format = "pretty"  # Options: "pretty", "json"
"#;

        std::fs::write(path.as_ref(), example).map_err(|e| {
            SpeedtestError::Config(format!("Failed to write example config: {}", e))
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.batch.base_port, 32768);
        assert_eq!(config.download.thread_count, 4);
        assert_eq!(config.download.max_bytes, 2 * 1024 * 1024);
        assert_eq!(config.general.speedtest_mode, SpeedtestMode::All);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.download.max_ticks = 21;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.probe.tcp_ping_count = 7;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.rules.match_rules.push(MatchRule {
            mode: MatchMode::Group,
            patterns: vec!["^US".to_string()],
            tag: "missing".to_string(),
        });
        assert!(config.validate().is_err());

        config.rules.test_files.push(TestFileRule {
            tag: "missing".to_string(),
            url: "http://example.com/10mb".to_string(),
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_example_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stairspeed.toml");
        Config::create_example(&path).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.clients.launch_mode, LaunchMode::Stdin);
        assert_eq!(config.probe.site_ping_fail_limit, 2);
        assert!((config.download.stable_tolerance - 0.08).abs() < f64::EPSILON);
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("PingOnly".parse::<SpeedtestMode>().unwrap(), SpeedtestMode::PingOnly);
        assert!("fast".parse::<SpeedtestMode>().is_err());

        let config: Config = toml::from_str("[general]\nspeedtest_mode = \"speedonly\"\n").unwrap();
        assert_eq!(config.general.speedtest_mode, SpeedtestMode::SpeedOnly);
    }
}
