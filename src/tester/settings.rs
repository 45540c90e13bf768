use crate::config::{Config, SpeedtestMode};
use crate::probe::{HttpTarget, SamplerLimits};
use crate::utils::error::Result;
use std::time::Duration;

/// Per-run test parameters, resolved once from the configuration.
#[derive(Debug, Clone)]
pub struct TesterSettings {
    pub mode: SpeedtestMode,
    pub test_site_ping: bool,
    pub test_upload: bool,
    pub test_nat_type: bool,
    pub test_geoip: bool,
    pub interactive: bool,

    pub tcp_ping_count: usize,
    pub tcp_ping_timeout: Duration,

    pub site_ping_target: HttpTarget,
    pub site_ping_count: usize,
    pub site_ping_fail_limit: usize,
    pub site_ping_timeout: Duration,

    pub download_threads: usize,
    pub sampler: SamplerLimits,
    pub socket_timeout: Duration,

    pub upload_target: HttpTarget,
    pub upload_interval: Duration,
    pub upload_max_ticks: usize,

    pub stun_server: String,
    pub stun_port: u16,
    pub nat_timeout: Duration,
}

impl TesterSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            mode: config.general.speedtest_mode,
            test_site_ping: config.general.test_site_ping,
            test_upload: config.general.test_upload,
            test_nat_type: config.general.test_nat_type,
            test_geoip: config.general.test_geoip,
            interactive: config.general.interactive,
            tcp_ping_count: config.probe.tcp_ping_count,
            tcp_ping_timeout: Duration::from_millis(config.probe.tcp_ping_timeout_ms),
            site_ping_target: HttpTarget::parse(&config.probe.site_ping_url)?,
            site_ping_count: config.probe.site_ping_count,
            site_ping_fail_limit: config.probe.site_ping_fail_limit,
            site_ping_timeout: Duration::from_millis(config.probe.site_ping_timeout_ms),
            download_threads: config.download.thread_count,
            sampler: SamplerLimits::from(&config.download),
            socket_timeout: Duration::from_millis(config.download.socket_timeout_ms),
            upload_target: HttpTarget::parse(&config.upload.url)?,
            upload_interval: Duration::from_millis(config.upload.interval_ms),
            upload_max_ticks: config.upload.max_ticks,
            stun_server: config.lookup.stun_server.clone(),
            stun_port: config.lookup.stun_port,
            nat_timeout: Duration::from_millis(config.lookup.nat_timeout_ms),
        })
    }

    pub fn runs_tcp_ping(&self) -> bool {
        self.mode != SpeedtestMode::SpeedOnly
    }

    pub fn runs_site_ping(&self) -> bool {
        self.test_site_ping
    }

    pub fn runs_download(&self) -> bool {
        self.mode != SpeedtestMode::PingOnly
    }

    pub fn runs_upload(&self) -> bool {
        self.test_upload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_gating() {
        let mut config = Config::default();
        let settings = TesterSettings::from_config(&config).unwrap();
        assert!(settings.runs_tcp_ping());
        assert!(settings.runs_site_ping());
        assert!(settings.runs_download());
        assert!(!settings.runs_upload());

        config.general.speedtest_mode = SpeedtestMode::PingOnly;
        config.general.test_upload = true;
        let settings = TesterSettings::from_config(&config).unwrap();
        assert!(!settings.runs_download());
        // upload is independent of the download gate
        assert!(settings.runs_upload());

        config.general.speedtest_mode = SpeedtestMode::SpeedOnly;
        let settings = TesterSettings::from_config(&config).unwrap();
        assert!(!settings.runs_tcp_ping());
        assert!(settings.runs_site_ping());
        assert!(settings.runs_upload());

        config.general.test_site_ping = false;
        let settings = TesterSettings::from_config(&config).unwrap();
        assert!(!settings.runs_site_ping());
    }
}
