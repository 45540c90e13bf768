use crate::utils::error::SpeedtestError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// SOCKS5 Version
pub const SOCKS_VERSION: u8 = 0x05;

/// RFC 1929 sub-negotiation version
pub const USERPASS_VERSION: u8 = 0x01;

/// Authentication methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthMethod {
    NoAuth = 0x00,
    UserPass = 0x02,
    NoAcceptable = 0xFF,
}

impl From<u8> for AuthMethod {
    fn from(value: u8) -> Self {
        match value {
            0x00 => AuthMethod::NoAuth,
            0x02 => AuthMethod::UserPass,
            _ => AuthMethod::NoAcceptable,
        }
    }
}

/// SOCKS5 commands issued by the tester
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Connect = 0x01,
    UdpAssociate = 0x03,
}

/// Address types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    IPv4([u8; 4]),
    IPv6([u8; 16]),
    Domain(String),
}

impl Address {
    /// Literal IPs become IP addresses, everything else is sent as a domain.
    pub fn from_host(host: &str) -> Self {
        let trimmed = host.trim_start_matches('[').trim_end_matches(']');
        match trimmed.parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) => Address::IPv4(v4.octets()),
            Ok(IpAddr::V6(v6)) => Address::IPv6(v6.octets()),
            Err(_) => Address::Domain(host.to_string()),
        }
    }

    /// Socket address when the address is a literal IP.
    pub fn to_socket_addr(&self, port: u16) -> Option<SocketAddr> {
        match self {
            Address::IPv4(octets) => Some(SocketAddr::new(Ipv4Addr::from(*octets).into(), port)),
            Address::IPv6(octets) => Some(SocketAddr::new(Ipv6Addr::from(*octets).into(), port)),
            Address::Domain(_) => None,
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr.ip() {
            IpAddr::V4(v4) => Address::IPv4(v4.octets()),
            IpAddr::V6(v6) => Address::IPv6(v6.octets()),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::IPv4(octets) => write!(f, "{}", Ipv4Addr::from(*octets)),
            Address::IPv6(octets) => write!(f, "{}", Ipv6Addr::from(*octets)),
            Address::Domain(domain) => write!(f, "{}", domain),
        }
    }
}

/// SOCKS5 reply codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    ConnectionNotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl TryFrom<u8> for ReplyCode {
    type Error = SpeedtestError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => ReplyCode::Succeeded,
            0x01 => ReplyCode::GeneralFailure,
            0x02 => ReplyCode::ConnectionNotAllowed,
            0x03 => ReplyCode::NetworkUnreachable,
            0x04 => ReplyCode::HostUnreachable,
            0x05 => ReplyCode::ConnectionRefused,
            0x06 => ReplyCode::TtlExpired,
            0x07 => ReplyCode::CommandNotSupported,
            0x08 => ReplyCode::AddressTypeNotSupported,
            other => return Err(SpeedtestError::ProxyReply(other)),
        })
    }
}

/// Username/password pair for RFC 1929 or HTTP basic proxy auth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Socks5,
    Http,
}

/// Where a test reaches a node: a local client inbound, or the node itself
/// for SOCKS/HTTP nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
}

impl ProxyEndpoint {
    pub fn local_socks(port: u16) -> Self {
        Self {
            kind: ProxyKind::Socks5,
            host: "127.0.0.1".to_string(),
            port,
            credentials: None,
        }
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.kind {
            ProxyKind::Socks5 => "socks5",
            ProxyKind::Http => "http",
        };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}

/// Header of a SOCKS5 UDP datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpHeader {
    pub frag: u8,
    pub address: Address,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpPacket {
    pub header: UdpHeader,
    pub data: Vec<u8>,
}
