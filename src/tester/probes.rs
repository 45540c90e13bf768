use super::settings::TesterSettings;
use crate::probe::{
    run_download, run_upload, site_ping, tcp_ping, DownloadOutcome, HttpClient, HttpTarget,
    SitePingReport, TcpPingReport, UploadOutcome,
};
use crate::protocol::ProxyEndpoint;
use crate::utils::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// The network measurements a node test is made of.
#[async_trait]
pub trait Probes: Send + Sync {
    async fn tcp_ping(&self, host: &str, port: u16) -> Result<TcpPingReport>;

    async fn site_ping(&self, proxy: &ProxyEndpoint) -> SitePingReport;

    async fn download(&self, proxy: &ProxyEndpoint, target: &HttpTarget) -> DownloadOutcome;

    async fn upload(&self, proxy: &ProxyEndpoint) -> UploadOutcome;
}

/// Probes that talk to the network.
pub struct NetworkProbes {
    client: HttpClient,
    settings: Arc<TesterSettings>,
}

impl NetworkProbes {
    pub fn new(client: HttpClient, settings: Arc<TesterSettings>) -> Self {
        Self { client, settings }
    }
}

#[async_trait]
impl Probes for NetworkProbes {
    async fn tcp_ping(&self, host: &str, port: u16) -> Result<TcpPingReport> {
        tcp_ping(
            host,
            port,
            self.settings.tcp_ping_count,
            self.settings.tcp_ping_timeout,
        )
        .await
    }

    async fn site_ping(&self, proxy: &ProxyEndpoint) -> SitePingReport {
        site_ping(
            &self.client,
            proxy,
            &self.settings.site_ping_target,
            self.settings.site_ping_count,
            self.settings.site_ping_fail_limit,
            self.settings.site_ping_timeout,
        )
        .await
    }

    async fn download(&self, proxy: &ProxyEndpoint, target: &HttpTarget) -> DownloadOutcome {
        run_download(
            &self.client,
            proxy,
            target,
            self.settings.download_threads,
            self.settings.sampler.clone(),
            self.settings.socket_timeout,
        )
        .await
    }

    async fn upload(&self, proxy: &ProxyEndpoint) -> UploadOutcome {
        run_upload(
            &self.client,
            proxy,
            &self.settings.upload_target,
            self.settings.upload_interval,
            self.settings.upload_max_ticks,
        )
        .await
    }
}
