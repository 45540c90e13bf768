use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpeedtestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Proxy refused request with reply code 0x{0:02x}")]
    ProxyReply(u8),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported address type: {0}")]
    UnsupportedAddressType(u8),

    #[error("Timed out: {0}")]
    Timeout(&'static str),

    #[error("Could not resolve host: {0}")]
    Resolve(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Client config rejected by {0}")]
    ClientValidation(String),

    #[error("Failed to start client {client}: {reason}")]
    ClientSpawn { client: String, reason: String },

    #[error("Failed to pass config to client over stdin: {0}")]
    ClientStdin(String),

    #[error("Client binary not found: {0}")]
    ClientMissing(String),

    #[error("Node {0} has no usable outbound in its rendered config")]
    MissingOutbound(u32),

    #[error("Not enough free local ports: needed {needed}, found {found}")]
    PortsExhausted { needed: usize, found: usize },

    #[error("Connection closed")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, SpeedtestError>;

impl SpeedtestError {
    pub(crate) fn timeout(what: &'static str) -> Self {
        SpeedtestError::Timeout(what)
    }
}
