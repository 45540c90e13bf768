//! SOCKS5 UDP relay datagram framing (RFC 1928 section 7).

use super::client::write_address;
use super::types::*;
use crate::utils::error::{Result, SpeedtestError};

/// Parse a datagram received from the relay.
pub fn parse_udp_packet(buf: &[u8]) -> Result<UdpPacket> {
    if buf.len() < 10 {
        return Err(SpeedtestError::Protocol("UDP packet too short".to_string()));
    }

    // RSV (2 bytes)
    let mut pos = 2;

    let frag = buf[pos];
    pos += 1;
    if frag != 0 {
        return Err(SpeedtestError::Protocol(
            "UDP fragmentation not supported".to_string(),
        ));
    }

    let address_type = buf[pos];
    pos += 1;

    let address = match address_type {
        0x01 => {
            let addr = [buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]];
            pos += 4;
            Address::IPv4(addr)
        }
        0x03 => {
            let domain_len = buf[pos] as usize;
            pos += 1;
            if buf.len() < pos + domain_len + 2 {
                return Err(SpeedtestError::Protocol(
                    "Invalid domain in UDP packet".to_string(),
                ));
            }
            let domain = String::from_utf8(buf[pos..pos + domain_len].to_vec()).map_err(|_| {
                SpeedtestError::Protocol("Invalid domain encoding in UDP packet".to_string())
            })?;
            pos += domain_len;
            Address::Domain(domain)
        }
        0x04 => {
            if buf.len() < pos + 16 + 2 {
                return Err(SpeedtestError::Protocol(
                    "Invalid IPv6 in UDP packet".to_string(),
                ));
            }
            let mut addr = [0u8; 16];
            addr.copy_from_slice(&buf[pos..pos + 16]);
            pos += 16;
            Address::IPv6(addr)
        }
        other => return Err(SpeedtestError::UnsupportedAddressType(other)),
    };

    let port = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
    pos += 2;

    Ok(UdpPacket {
        header: UdpHeader {
            frag,
            address,
            port,
        },
        data: buf[pos..].to_vec(),
    })
}

/// Frame a payload for the relay.
pub fn serialize_udp_packet(packet: &UdpPacket) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(packet.data.len() + 22);
    buf.extend_from_slice(&[0x00, 0x00]);
    buf.push(packet.header.frag);
    write_address(&mut buf, &packet.header.address)?;
    buf.extend_from_slice(&packet.header.port.to_be_bytes());
    buf.extend_from_slice(&packet.data);
    Ok(buf)
}
