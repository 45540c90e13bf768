use crate::utils::error::{Result, SpeedtestError};
use socket2::{Domain, Socket, Type};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tracing::debug;

/// Reports whether a local port can be bound right now.
pub type PortProbe = Arc<dyn Fn(u16) -> bool + Send + Sync>;

/// Bind-check `127.0.0.1:port` without keeping the socket.
pub fn port_is_free(port: u16) -> bool {
    let socket = match Socket::new(Domain::IPV4, Type::STREAM, None) {
        Ok(socket) => socket,
        Err(_) => return false,
    };
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    socket.bind(&addr.into()).is_ok()
}

/// Hands out runs of free local ports, scanning upward from a base port.
#[derive(Clone)]
pub struct PortAllocator {
    base: u16,
    reserved: Option<u16>,
    probe: PortProbe,
}

impl PortAllocator {
    pub fn new(base: u16, reserved: Option<u16>) -> Self {
        Self::with_probe(base, reserved, Arc::new(port_is_free))
    }

    pub fn with_probe(base: u16, reserved: Option<u16>, probe: PortProbe) -> Self {
        Self {
            base,
            reserved,
            probe,
        }
    }

    /// Allocate `count` distinct free ports. Fails with `PortsExhausted`
    /// when the scan reaches 65535 first.
    pub fn allocate(&self, count: usize) -> Result<Vec<u16>> {
        let mut ports = Vec::with_capacity(count);
        let mut used = HashSet::with_capacity(count);
        if count == 0 {
            return Ok(ports);
        }

        for port in self.base..=u16::MAX {
            if Some(port) == self.reserved || used.contains(&port) {
                continue;
            }
            if !(self.probe)(port) {
                continue;
            }
            used.insert(port);
            ports.push(port);
            if ports.len() == count {
                debug!(count, first = ports[0], last = port, "Allocated local ports");
                return Ok(ports);
            }
        }

        Err(SpeedtestError::PortsExhausted {
            needed: count,
            found: ports.len(),
        })
    }
}

impl std::fmt::Debug for PortAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortAllocator")
            .field("base", &self.base)
            .field("reserved", &self.reserved)
            .finish()
    }
}
