use crate::config::LaunchMode;
use crate::node::LinkType;
use std::fmt;
use std::path::{Path, PathBuf};

/// File name the client is pointed at in file launch mode.
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Local proxy client binaries the tester knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientKind {
    V2ray,
    SsLocal,
    SsrLocal,
    Trojan,
}

impl ClientKind {
    pub const ALL: [ClientKind; 4] = [
        ClientKind::V2ray,
        ClientKind::SsLocal,
        ClientKind::SsrLocal,
        ClientKind::Trojan,
    ];

    /// Client hosting a node of `link_type`, if one is needed.
    pub fn for_link(link_type: LinkType) -> Option<ClientKind> {
        match link_type {
            LinkType::Vmess | LinkType::Vless => Some(ClientKind::V2ray),
            LinkType::Shadowsocks => Some(ClientKind::SsLocal),
            LinkType::ShadowsocksR => Some(ClientKind::SsrLocal),
            LinkType::Trojan => Some(ClientKind::Trojan),
            LinkType::Socks | LinkType::Http => None,
        }
    }

    pub fn binary_name(&self) -> &'static str {
        match self {
            ClientKind::V2ray => "v2ray",
            ClientKind::SsLocal => "ss-local",
            ClientKind::SsrLocal => "ssr-local",
            ClientKind::Trojan => "trojan",
        }
    }

    /// Whether the client has a config test mode.
    pub fn supports_test_mode(&self) -> bool {
        matches!(self, ClientKind::V2ray)
    }

    /// Whether the client can read its config from stdin.
    pub fn supports_stdin(&self) -> bool {
        matches!(self, ClientKind::V2ray)
    }

    /// Arguments for a normal run.
    pub fn run_args(&self, mode: LaunchMode) -> Vec<String> {
        let config = match mode {
            LaunchMode::Stdin if self.supports_stdin() => "stdin:",
            _ => CONFIG_FILE_NAME,
        };
        match self {
            ClientKind::V2ray => vec!["-config".into(), config.into()],
            ClientKind::SsLocal | ClientKind::SsrLocal => {
                vec!["-u".into(), "-c".into(), config.into()]
            }
            ClientKind::Trojan => vec!["-c".into(), config.into()],
        }
    }

    /// Arguments for config validation, if the client supports it.
    pub fn test_args(&self, mode: LaunchMode) -> Option<Vec<String>> {
        if !self.supports_test_mode() {
            return None;
        }
        let mut args = vec!["-test".to_string()];
        args.extend(self.run_args(mode));
        Some(args)
    }

    /// Effective launch mode: clients without stdin support fall back to file mode.
    pub fn effective_mode(&self, requested: LaunchMode) -> LaunchMode {
        match requested {
            LaunchMode::Stdin if self.supports_stdin() => LaunchMode::Stdin,
            _ => LaunchMode::File,
        }
    }
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary_name())
    }
}

/// Location of the client binaries.
#[derive(Debug, Clone)]
pub struct ClientPaths {
    dir: PathBuf,
}

impl ClientPaths {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn binary(&self, kind: ClientKind) -> PathBuf {
        let name = if cfg!(windows) {
            format!("{}.exe", kind.binary_name())
        } else {
            kind.binary_name().to_string()
        };
        self.dir.join(name)
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE_NAME)
    }

    /// Which client binaries are present.
    pub fn detect(&self) -> Vec<(ClientKind, bool)> {
        ClientKind::ALL
            .iter()
            .map(|kind| (*kind, self.binary(*kind).is_file()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_templates() {
        assert_eq!(
            ClientKind::V2ray.run_args(LaunchMode::Stdin),
            vec!["-config", "stdin:"]
        );
        assert_eq!(
            ClientKind::V2ray.test_args(LaunchMode::File).unwrap(),
            vec!["-test", "-config", "config.json"]
        );
        assert_eq!(
            ClientKind::SsrLocal.run_args(LaunchMode::Stdin),
            vec!["-u", "-c", "config.json"]
        );
        assert_eq!(
            ClientKind::Trojan.run_args(LaunchMode::File),
            vec!["-c", "config.json"]
        );
        assert!(ClientKind::SsLocal.test_args(LaunchMode::File).is_none());
    }

    #[test]
    fn test_mode_fallback() {
        assert_eq!(
            ClientKind::Trojan.effective_mode(LaunchMode::Stdin),
            LaunchMode::File
        );
        assert_eq!(
            ClientKind::V2ray.effective_mode(LaunchMode::Stdin),
            LaunchMode::Stdin
        );
    }

    #[test]
    fn test_detect_binaries() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ClientPaths::new(dir.path());
        std::fs::write(paths.binary(ClientKind::Trojan), b"").unwrap();

        let found = paths.detect();
        assert!(found.contains(&(ClientKind::Trojan, true)));
        assert!(found.contains(&(ClientKind::V2ray, false)));
        assert_eq!(ClientKind::for_link(LinkType::Vless), Some(ClientKind::V2ray));
        assert_eq!(ClientKind::for_link(LinkType::Socks), None);
    }
}
