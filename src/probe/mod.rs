//! Network probes run against a node or its local client.

pub mod download;
pub mod http;
pub mod readiness;
pub mod resolver;
pub mod sampler;
pub mod site_ping;
pub mod tcping;
pub mod testfile;
pub mod upload;

pub use download::{run_download, DownloadOutcome, DownloadSession};
pub use http::{HttpClient, HttpTarget};
pub use readiness::{ReadinessCheck, ReadinessProber};
pub use sampler::{SamplerLimits, SpeedSampler, StopReason};
pub use site_ping::{site_ping, SitePingReport};
pub use tcping::{tcp_ping, TcpPingReport};
pub use testfile::TestFileSelector;
pub use upload::{run_upload, UploadOutcome};
