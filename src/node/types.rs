use crate::config::{MAX_SITE_PINGS, MAX_SPEED_SAMPLES, MAX_TCP_PINGS};
use crate::protocol::{Credentials, ProxyEndpoint, ProxyKind};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Proxy protocol of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    Vmess,
    Vless,
    #[serde(alias = "ss")]
    Shadowsocks,
    #[serde(alias = "ssr")]
    ShadowsocksR,
    Trojan,
    #[serde(alias = "socks5")]
    Socks,
    Http,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::Vmess => "vmess",
            LinkType::Vless => "vless",
            LinkType::Shadowsocks => "ss",
            LinkType::ShadowsocksR => "ssr",
            LinkType::Trojan => "trojan",
            LinkType::Socks => "socks",
            LinkType::Http => "http",
        }
    }

    /// Protocols one v2ray-family client can host many of at once.
    pub fn is_aggregatable(&self) -> bool {
        matches!(self, LinkType::Vmess | LinkType::Vless)
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed-capacity sample storage with an explicit count.
///
/// Writes past capacity are refused rather than dropped silently, so callers
/// can stop sampling as soon as the buffer is full.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleBuffer<T, const N: usize> {
    samples: [T; N],
    len: usize,
}

impl<T: Copy + Default, const N: usize> SampleBuffer<T, N> {
    pub fn new() -> Self {
        Self {
            samples: [T::default(); N],
            len: 0,
        }
    }

    /// Append a sample. Returns `false` when the buffer is already full.
    pub fn push(&mut self, value: T) -> bool {
        if self.len >= N {
            return false;
        }
        self.samples[self.len] = value;
        self.len += 1;
        true
    }

    pub fn as_slice(&self) -> &[T] {
        &self.samples[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == N
    }

    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<T: Copy + Default, const N: usize> Default for SampleBuffer<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy + Default + fmt::Display, const N: usize> SampleBuffer<T, N> {
    /// Comma separated samples, as written to result files.
    pub fn join(&self) -> String {
        self.as_slice()
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoIpInfo {
    pub organization: String,
    pub country_code: String,
}

/// Terminal classification of a node test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    Success,
    NoResolve,
    NoConnection,
    NoSpeed,
    ClientStartup,
    NotReady,
    InvalidConfig,
    PortsExhausted,
    Internal,
}

impl TestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestOutcome::Success => "success",
            TestOutcome::NoResolve => "no_resolve",
            TestOutcome::NoConnection => "no_connection",
            TestOutcome::NoSpeed => "no_speed",
            TestOutcome::ClientStartup => "client_startup",
            TestOutcome::NotReady => "not_ready",
            TestOutcome::InvalidConfig => "invalid_config",
            TestOutcome::PortsExhausted => "ports_exhausted",
            TestOutcome::Internal => "internal",
        }
    }
}

impl fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Measurements gathered for one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeResults {
    pub online: bool,
    pub raw_ping: SampleBuffer<u32, MAX_TCP_PINGS>,
    pub avg_ping_ms: f64,
    /// Fraction of failed TCP pings, 0.0..=1.0.
    pub packet_loss: f64,
    pub raw_site_ping: SampleBuffer<u32, MAX_SITE_PINGS>,
    pub site_ping_ms: f64,
    pub raw_speed: SampleBuffer<u64, MAX_SPEED_SAMPLES>,
    pub avg_speed: Option<f64>,
    pub max_speed: Option<f64>,
    pub upload_speed: Option<f64>,
    pub total_recv_bytes: u64,
    pub nat_type: String,
    pub inbound_geoip: Option<GeoIpInfo>,
    pub outbound_geoip: Option<GeoIpInfo>,
    pub test_file: String,
    pub duration_secs: u64,
    pub completed_seq: u64,
    pub completed_ms: u64,
    pub outcome: Option<TestOutcome>,
}

impl Default for NodeResults {
    fn default() -> Self {
        Self {
            online: false,
            raw_ping: SampleBuffer::new(),
            avg_ping_ms: 0.0,
            packet_loss: 1.0,
            raw_site_ping: SampleBuffer::new(),
            site_ping_ms: 0.0,
            raw_speed: SampleBuffer::new(),
            avg_speed: None,
            max_speed: None,
            upload_speed: None,
            total_recv_bytes: 0,
            nat_type: "Unknown".to_string(),
            inbound_geoip: None,
            outbound_geoip: None,
            test_file: String::new(),
            duration_secs: 0,
            completed_seq: 0,
            completed_ms: 0,
            outcome: None,
        }
    }
}

/// A proxy node as handed over by the link parser, plus its results.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeRecord {
    #[serde(default)]
    pub id: u32,
    #[serde(default)]
    pub group_id: u32,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub remarks: String,
    pub link_type: LinkType,
    pub server: String,
    pub port: u16,
    /// Client configuration produced by the template renderer.
    pub rendered_config: String,
    #[serde(default)]
    pub original_share_link: Option<String>,
    /// Auth for SOCKS/HTTP nodes tested directly.
    #[serde(default)]
    pub credentials: Option<Credentials>,
    #[serde(skip)]
    pub results: NodeResults,
}

impl NodeRecord {
    pub fn new(id: u32, link_type: LinkType, server: &str, port: u16, rendered_config: &str) -> Self {
        Self {
            id,
            group_id: 0,
            group: String::new(),
            remarks: format!("{}:{}", server, port),
            link_type,
            server: server.to_string(),
            port,
            rendered_config: rendered_config.to_string(),
            original_share_link: None,
            credentials: None,
            results: NodeResults::default(),
        }
    }

    /// `proto|server|port`, the section key used in result files.
    pub fn section_key(&self) -> String {
        format!("{}|{}|{}", self.link_type, self.server, self.port)
    }

    /// The node's own endpoint, for protocols that need no local client.
    pub fn direct_endpoint(&self) -> Option<ProxyEndpoint> {
        let kind = match self.link_type {
            LinkType::Socks => ProxyKind::Socks5,
            LinkType::Http => ProxyKind::Http,
            _ => return None,
        };
        Some(ProxyEndpoint {
            kind,
            host: self.server.clone(),
            port: self.port,
            credentials: self.credentials.clone(),
        })
    }

    /// Record a terminal failure. Never marks the node online.
    pub fn fail(&mut self, outcome: TestOutcome) {
        self.results.online = false;
        self.results.outcome = Some(outcome);
    }
}
