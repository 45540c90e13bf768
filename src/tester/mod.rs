//! Single-node test sequence: TCP ping, site ping, download (one retry),
//! optional upload, then NAT and GeoIP lookups.

pub mod probes;
pub mod settings;

pub use probes::{NetworkProbes, Probes};
pub use settings::TesterSettings;

use crate::lookup::{GeoIpLookup, NatTypeLookup};
use crate::node::{GeoIpInfo, NodeRecord, TestOutcome, TestSession, TestStage};
use crate::probe::{HttpTarget, TestFileSelector};
use crate::protocol::{ProxyEndpoint, ProxyKind};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// NAT/GeoIP lookups still in flight when the test itself finished.
#[derive(Debug, Default)]
pub struct DeferredLookups {
    nat: Option<JoinHandle<String>>,
    inbound: Option<JoinHandle<Option<GeoIpInfo>>>,
    outbound: Option<JoinHandle<Option<GeoIpInfo>>>,
}

impl DeferredLookups {
    pub fn is_empty(&self) -> bool {
        self.nat.is_none() && self.inbound.is_none() && self.outbound.is_none()
    }

    /// Wait for every pending lookup and store the results on `node`.
    /// Failed lookups leave the defaults in place.
    pub async fn resolve_into(self, node: &mut NodeRecord) {
        if let Some(handle) = self.nat {
            match handle.await {
                Ok(nat) => node.results.nat_type = nat,
                Err(e) => warn!(node_id = node.id, error = %e, "NAT lookup task failed"),
            }
        }
        if let Some(handle) = self.inbound {
            match handle.await {
                Ok(info) => node.results.inbound_geoip = info,
                Err(e) => warn!(node_id = node.id, error = %e, "Inbound GeoIP task failed"),
            }
        }
        if let Some(handle) = self.outbound {
            match handle.await {
                Ok(info) => node.results.outbound_geoip = info,
                Err(e) => warn!(node_id = node.id, error = %e, "Outbound GeoIP task failed"),
            }
        }
    }
}

#[derive(Debug)]
pub struct TestReport {
    pub node: NodeRecord,
    pub deferred: DeferredLookups,
}

impl TestReport {
    pub fn finished(node: NodeRecord) -> Self {
        Self {
            node,
            deferred: DeferredLookups::default(),
        }
    }

    /// Resolve pending lookups and hand back the node.
    pub async fn into_resolved(self) -> NodeRecord {
        let mut node = self.node;
        self.deferred.resolve_into(&mut node).await;
        node
    }
}

/// Runs the full test sequence for one node through `endpoint`.
#[async_trait]
pub trait NodeTest: Send + Sync {
    async fn test_node(&self, node: NodeRecord, endpoint: ProxyEndpoint) -> TestReport;
}

pub struct NodeTester {
    settings: Arc<TesterSettings>,
    probes: Arc<dyn Probes>,
    geoip: Arc<dyn GeoIpLookup>,
    nat: Arc<dyn NatTypeLookup>,
    selector: Arc<TestFileSelector>,
}

impl NodeTester {
    pub fn new(
        settings: Arc<TesterSettings>,
        probes: Arc<dyn Probes>,
        geoip: Arc<dyn GeoIpLookup>,
        nat: Arc<dyn NatTypeLookup>,
        selector: Arc<TestFileSelector>,
    ) -> Self {
        Self {
            settings,
            probes,
            geoip,
            nat,
            selector,
        }
    }

    fn fail(node: &mut NodeRecord, session: &mut TestSession, outcome: TestOutcome) {
        session.fail(outcome);
        node.fail(outcome);
        node.results.duration_secs = session.elapsed_secs();
        info!(node_id = node.id, remarks = %node.remarks, %outcome, "Node test failed");
    }

    fn spawn_lookups(&self, node: &NodeRecord, endpoint: &ProxyEndpoint) -> DeferredLookups {
        let mut deferred = DeferredLookups::default();

        if self.settings.test_nat_type && endpoint.kind == ProxyKind::Socks5 {
            let nat = Arc::clone(&self.nat);
            let endpoint = endpoint.clone();
            let server = self.settings.stun_server.clone();
            let port = self.settings.stun_port;
            let limit = self.settings.nat_timeout;
            deferred.nat = Some(tokio::spawn(async move {
                timeout(limit, nat.lookup(&endpoint, &server, port))
                    .await
                    .unwrap_or_else(|_| "Unknown".to_string())
            }));
        }

        if self.settings.test_geoip {
            let geoip = Arc::clone(&self.geoip);
            let host = node.server.clone();
            deferred.inbound = Some(tokio::spawn(async move {
                geoip.lookup(Some(&host), None).await
            }));

            let geoip = Arc::clone(&self.geoip);
            let endpoint = endpoint.clone();
            deferred.outbound = Some(tokio::spawn(async move {
                geoip.lookup(None, Some(&endpoint)).await
            }));
        }

        deferred
    }
}

#[async_trait]
impl NodeTest for NodeTester {
    async fn test_node(&self, mut node: NodeRecord, endpoint: ProxyEndpoint) -> TestReport {
        let settings = &self.settings;
        let mut session = TestSession::new(node.id);
        debug!(node_id = node.id, %endpoint, "Testing node");

        if settings.runs_tcp_ping() {
            session.advance(TestStage::PingingTcp);
            match self.probes.tcp_ping(&node.server, node.port).await {
                Err(e) => {
                    warn!(node_id = node.id, server = %node.server, error = %e, "Cannot resolve node");
                    Self::fail(&mut node, &mut session, TestOutcome::NoResolve);
                    return TestReport::finished(node);
                }
                Ok(report) => {
                    for sample in &report.samples {
                        if !node.results.raw_ping.push(sample.unwrap_or(0)) {
                            break;
                        }
                    }
                    node.results.avg_ping_ms = report.average_ms();
                    node.results.packet_loss = report.loss();
                    if report.loss() >= 1.0 {
                        Self::fail(&mut node, &mut session, TestOutcome::NoConnection);
                        return TestReport::finished(node);
                    }
                }
            }
        } else {
            node.results.packet_loss = 0.0;
        }

        if settings.runs_site_ping() {
            session.advance(TestStage::PingingSite);
            let report = self.probes.site_ping(&endpoint).await;
            for &sample in &report.samples {
                if !node.results.raw_site_ping.push(sample) {
                    break;
                }
            }
            node.results.site_ping_ms = report.average_ms();
            if !report.any_success() {
                Self::fail(&mut node, &mut session, TestOutcome::NoConnection);
                return TestReport::finished(node);
            }
        }

        if settings.runs_download() {
            session.advance(TestStage::Downloading);
            let test_file = self.selector.select(&node).to_string();
            let target = match HttpTarget::parse(&test_file) {
                Ok(target) => target,
                Err(e) => {
                    warn!(node_id = node.id, error = %e, "Unusable test file");
                    Self::fail(&mut node, &mut session, TestOutcome::Internal);
                    return TestReport::finished(node);
                }
            };
            node.results.test_file = test_file;

            let mut outcome = self.probes.download(&endpoint, &target).await;
            if outcome.total_bytes == 0 {
                session.advance(TestStage::Retrying);
                info!(node_id = node.id, "No data received, retrying download once");
                outcome = self.probes.download(&endpoint, &target).await;
            }
            if outcome.total_bytes == 0 {
                Self::fail(&mut node, &mut session, TestOutcome::NoSpeed);
                return TestReport::finished(node);
            }

            node.results.raw_speed = outcome.samples;
            node.results.total_recv_bytes += outcome.total_bytes;
            node.results.avg_speed = Some(outcome.avg_speed).filter(|v| *v > 0.0);
            node.results.max_speed = Some(outcome.max_speed as f64).filter(|v| *v > 0.0);
        }

        if settings.runs_upload() {
            session.advance(TestStage::Uploading);
            let upload = self.probes.upload(&endpoint).await;
            node.results.upload_speed = upload.speed;
            node.results.total_recv_bytes += upload.total_bytes;
        }

        session.advance(TestStage::AwaitingAsync);
        let mut deferred = self.spawn_lookups(&node, &endpoint);
        node.results.online = true;
        node.results.outcome = Some(TestOutcome::Success);
        node.results.duration_secs = session.elapsed_secs();

        if settings.interactive {
            deferred.resolve_into(&mut node).await;
            deferred = DeferredLookups::default();
        }
        session.advance(TestStage::Completed);

        info!(
            node_id = node.id,
            remarks = %node.remarks,
            ping_ms = node.results.avg_ping_ms,
            site_ping_ms = node.results.site_ping_ms,
            recv_bytes = node.results.total_recv_bytes,
            "Node test completed"
        );
        TestReport { node, deferred }
    }
}
