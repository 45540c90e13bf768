use crate::node::GeoIpInfo;
use crate::probe::http::{HttpClient, HttpTarget};
use crate::probe::resolver::resolve_host;
use crate::protocol::ProxyEndpoint;
use crate::utils::error::{Result, SpeedtestError};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::time::timeout;
use tracing::debug;

const MAX_BODY: usize = 64 * 1024;

/// GeoIP lookup for a host. `proxy` routes the request through the node,
/// which locates the node's exit address.
#[async_trait]
pub trait GeoIpLookup: Send + Sync {
    async fn lookup(&self, host: Option<&str>, proxy: Option<&ProxyEndpoint>) -> Option<GeoIpInfo>;
}

/// Always reports nothing.
pub struct DisabledGeoIp;

#[async_trait]
impl GeoIpLookup for DisabledGeoIp {
    async fn lookup(&self, _host: Option<&str>, _proxy: Option<&ProxyEndpoint>) -> Option<GeoIpInfo> {
        None
    }
}

#[derive(Debug, Deserialize)]
struct GeoIpResponse {
    #[serde(default)]
    organization: Option<String>,
    #[serde(default)]
    isp: Option<String>,
    #[serde(default)]
    country_code: Option<String>,
    #[serde(default, rename = "countryCode")]
    country_code_camel: Option<String>,
}

/// JSON GeoIP API client: `GET <api>/<ip>`, or `GET <api>` for the caller's
/// own address.
pub struct HttpGeoIp {
    client: HttpClient,
    api: String,
    limit: Duration,
}

impl HttpGeoIp {
    pub fn new(client: HttpClient, api: &str, limit: Duration) -> Self {
        Self {
            client,
            api: api.trim_end_matches('/').to_string(),
            limit,
        }
    }

    async fn query(&self, host: Option<&str>, proxy: Option<&ProxyEndpoint>) -> Result<GeoIpInfo> {
        let url = match host {
            Some(host) => {
                let ip = resolve_host(host, 0).await?[0].ip();
                format!("{}/{}", self.api, ip)
            }
            None => self.api.clone(),
        };
        let target = HttpTarget::parse(&url)?;
        let (mut io, head) = self.client.get(proxy, &target).await?;
        if !head.is_success() {
            return Err(SpeedtestError::Http(format!("GeoIP API returned {}", head.status)));
        }

        let mut body = head.body_prefix.to_vec();
        let wanted = head.content_length.map(|l| l as usize).unwrap_or(MAX_BODY).min(MAX_BODY);
        let mut buf = [0u8; 4096];
        while body.len() < wanted {
            let n = io.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&buf[..n]);
        }

        let parsed: GeoIpResponse = serde_json::from_slice(&body)?;
        Ok(GeoIpInfo {
            organization: parsed.organization.or(parsed.isp).unwrap_or_default(),
            country_code: parsed
                .country_code
                .or(parsed.country_code_camel)
                .unwrap_or_default(),
        })
    }
}

#[async_trait]
impl GeoIpLookup for HttpGeoIp {
    async fn lookup(&self, host: Option<&str>, proxy: Option<&ProxyEndpoint>) -> Option<GeoIpInfo> {
        match timeout(self.limit, self.query(host, proxy)).await {
            Ok(Ok(info)) => Some(info),
            Ok(Err(e)) => {
                debug!(host, error = %e, "GeoIP lookup failed");
                None
            }
            Err(_) => {
                debug!(host, "GeoIP lookup timed out");
                None
            }
        }
    }
}
