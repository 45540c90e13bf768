//! NAT type detection through a SOCKS5 UDP relay using classic STUN
//! binding tests (RFC 3489 section 10.1).

use crate::probe::resolver::resolve_host;
use crate::protocol::client::{negotiate, udp_associate};
use crate::protocol::types::{UdpHeader, UdpPacket};
use crate::protocol::udp::{parse_udp_packet, serialize_udp_packet};
use crate::protocol::{Address, ProxyEndpoint};
use crate::utils::error::{Result, SpeedtestError};
use async_trait::async_trait;
use rand::RngCore;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::debug;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;
const MAGIC_COOKIE: u32 = 0x2112_A442;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_CHANGE_REQUEST: u16 = 0x0003;
const ATTR_CHANGED_ADDRESS: u16 = 0x0005;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_OTHER_ADDRESS: u16 = 0x802C;

const CHANGE_IP: u32 = 0x04;
const CHANGE_PORT: u32 = 0x02;

/// NAT classification of a node's UDP path.
#[async_trait]
pub trait NatTypeLookup: Send + Sync {
    async fn lookup(&self, proxy: &ProxyEndpoint, stun_server: &str, stun_port: u16) -> String;
}

pub struct DisabledNat;

#[async_trait]
impl NatTypeLookup for DisabledNat {
    async fn lookup(&self, _proxy: &ProxyEndpoint, _stun_server: &str, _stun_port: u16) -> String {
        "Unknown".to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingResponse {
    pub mapped: Option<SocketAddr>,
    pub changed: Option<SocketAddr>,
}

pub fn build_binding_request(transaction_id: &[u8; 12], change_flags: u32) -> Vec<u8> {
    let attr_len: u16 = if change_flags != 0 { 8 } else { 0 };
    let mut buf = Vec::with_capacity(20 + attr_len as usize);
    buf.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
    buf.extend_from_slice(&attr_len.to_be_bytes());
    buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    buf.extend_from_slice(transaction_id);
    if change_flags != 0 {
        buf.extend_from_slice(&ATTR_CHANGE_REQUEST.to_be_bytes());
        buf.extend_from_slice(&4u16.to_be_bytes());
        buf.extend_from_slice(&change_flags.to_be_bytes());
    }
    buf
}

fn parse_address(value: &[u8], xor: bool, transaction_id: &[u8; 12]) -> Option<SocketAddr> {
    if value.len() < 8 {
        return None;
    }
    let family = value[1];
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    if xor {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }
    match family {
        0x01 => {
            let mut ip = u32::from_be_bytes([value[4], value[5], value[6], value[7]]);
            if xor {
                ip ^= MAGIC_COOKIE;
            }
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port))
        }
        0x02 if value.len() >= 20 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            if xor {
                let mut key = [0u8; 16];
                key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
                key[4..].copy_from_slice(transaction_id);
                for (o, k) in octets.iter_mut().zip(key.iter()) {
                    *o ^= k;
                }
            }
            Some(SocketAddr::new(IpAddr::from(octets), port))
        }
        _ => None,
    }
}

/// Parse a binding response matching `transaction_id`.
pub fn parse_binding_response(buf: &[u8], transaction_id: &[u8; 12]) -> Option<BindingResponse> {
    if buf.len() < 20 {
        return None;
    }
    let msg_type = u16::from_be_bytes([buf[0], buf[1]]);
    let msg_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if msg_type != BINDING_RESPONSE || &buf[8..20] != transaction_id || buf.len() < 20 + msg_len {
        return None;
    }

    let mut response = BindingResponse {
        mapped: None,
        changed: None,
    };
    let mut xor_mapped = None;
    let mut pos = 20;
    while pos + 4 <= 20 + msg_len {
        let attr_type = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
        let attr_len = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]) as usize;
        let start = pos + 4;
        let end = start + attr_len;
        if end > buf.len() {
            break;
        }
        let value = &buf[start..end];
        match attr_type {
            ATTR_MAPPED_ADDRESS => response.mapped = parse_address(value, false, transaction_id),
            ATTR_XOR_MAPPED_ADDRESS => xor_mapped = parse_address(value, true, transaction_id),
            ATTR_CHANGED_ADDRESS | ATTR_OTHER_ADDRESS => {
                response.changed = parse_address(value, false, transaction_id)
            }
            _ => {}
        }
        // Attributes are padded to 4 bytes.
        pos = start + attr_len.div_ceil(4) * 4;
    }
    if xor_mapped.is_some() {
        response.mapped = xor_mapped;
    }
    Some(response)
}

/// STUN binding tests relayed through the node's SOCKS5 UDP ASSOCIATE.
pub struct StunNatProbe {
    transaction_timeout: Duration,
    attempts: u32,
}

impl StunNatProbe {
    pub fn new(transaction_timeout: Duration) -> Self {
        Self {
            transaction_timeout,
            attempts: 2,
        }
    }

    async fn classify(&self, proxy: &ProxyEndpoint, stun_server: &str, stun_port: u16) -> Result<String> {
        let mut control = TcpStream::connect((proxy.host.as_str(), proxy.port)).await?;
        negotiate(&mut control, proxy.credentials.as_ref()).await?;
        let (relay_addr, relay_port) = udp_associate(&mut control).await?;
        let relay = match relay_addr.to_socket_addr(relay_port) {
            Some(addr) if !addr.ip().is_unspecified() => addr,
            _ => resolve_host(&proxy.host, relay_port).await?[0],
        };

        let socket = UdpSocket::bind(if relay.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" }).await?;
        socket.connect(relay).await?;
        let relayed = RelayedStun {
            socket,
            transaction_timeout: self.transaction_timeout,
            attempts: self.attempts,
        };

        let primary = Address::from_host(stun_server);
        let Some(first) = relayed.binding(&primary, stun_port, 0).await? else {
            return Ok("Blocked".to_string());
        };
        let Some(mapped) = first.mapped else {
            return Ok("Unknown".to_string());
        };

        if relayed
            .binding(&primary, stun_port, CHANGE_IP | CHANGE_PORT)
            .await?
            .is_some()
        {
            return Ok("FullCone".to_string());
        }

        let Some(changed) = first.changed else {
            return Ok("Unknown".to_string());
        };
        let second = relayed
            .binding(&Address::from(changed), changed.port(), 0)
            .await?;
        match second.and_then(|r| r.mapped) {
            None => return Ok("Unknown".to_string()),
            Some(other) if other != mapped => return Ok("Symmetric".to_string()),
            Some(_) => {}
        }

        if relayed
            .binding(&primary, stun_port, CHANGE_PORT)
            .await?
            .is_some()
        {
            Ok("Restricted".to_string())
        } else {
            Ok("PortRestricted".to_string())
        }
    }
}

struct RelayedStun {
    socket: UdpSocket,
    transaction_timeout: Duration,
    attempts: u32,
}

impl RelayedStun {
    /// One binding transaction; `None` when no response arrived.
    async fn binding(
        &self,
        server: &Address,
        port: u16,
        change_flags: u32,
    ) -> Result<Option<BindingResponse>> {
        let mut transaction_id = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut transaction_id);
        let datagram = serialize_udp_packet(&UdpPacket {
            header: UdpHeader {
                frag: 0,
                address: server.clone(),
                port,
            },
            data: build_binding_request(&transaction_id, change_flags),
        })?;

        let mut buf = [0u8; 1500];
        for _ in 0..self.attempts {
            self.socket.send(&datagram).await?;
            let deadline = tokio::time::Instant::now() + self.transaction_timeout;
            loop {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                let n = match timeout(remaining, self.socket.recv(&mut buf)).await {
                    Ok(res) => res?,
                    Err(_) => break,
                };
                let Ok(packet) = parse_udp_packet(&buf[..n]) else {
                    continue;
                };
                if let Some(response) = parse_binding_response(&packet.data, &transaction_id) {
                    return Ok(Some(response));
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl NatTypeLookup for StunNatProbe {
    async fn lookup(&self, proxy: &ProxyEndpoint, stun_server: &str, stun_port: u16) -> String {
        match self.classify(proxy, stun_server, stun_port).await {
            Ok(nat) => nat,
            Err(e) => {
                debug!(%proxy, error = %e, "NAT type detection failed");
                match e {
                    SpeedtestError::ProxyReply(_) => "Blocked".to_string(),
                    _ => "Unknown".to_string(),
                }
            }
        }
    }
}
