//! Peer addresses and local/remote classification
//!
//! An address is local when its IP is loopback, unspecified, or assigned to
//! one of this host's interfaces (checked by binding a UDP socket to it), and
//! its port is absent or equal to this node's forwarding port. Another node
//! on the same host listens on a different port and stays remote. Hostnames
//! are resolved first; a name that does not resolve is treated as remote and
//! will fail over to local processing on connection error.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, UdpSocket};

/// Where a group of records goes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    Local,
    Remote(String),
}

/// Host and port of a peer's forwarding endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    host: String,
    port: u16,
}

impl PeerAddress {
    /// Accepts `ip`, `ip:port`, `[ipv6]:port`, `host` and `host:port`.
    /// Addresses without a port use `default_port`.
    pub fn parse(address: &str, default_port: u16) -> PeerAddress {
        let address = address.trim();
        if let Ok(socket) = address.parse::<SocketAddr>() {
            return PeerAddress {
                host: socket.ip().to_string(),
                port: socket.port(),
            };
        }
        let unbracketed = address.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = unbracketed.parse::<IpAddr>() {
            return PeerAddress {
                host: ip.to_string(),
                port: default_port,
            };
        }
        if let Some((host, port)) = address.rsplit_once(':') {
            if let Ok(port) = port.parse::<u16>() {
                return PeerAddress {
                    host: host.to_string(),
                    port,
                };
            }
        }
        PeerAddress {
            host: address.to_string(),
            port: default_port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    pub fn url(&self, scheme: &str, path: &str) -> String {
        match self.ip() {
            Some(IpAddr::V6(ip)) => format!("{}://[{}]:{}{}", scheme, ip, self.port, path),
            _ => format!("{}://{}:{}{}", scheme, self.host, self.port, path),
        }
    }
}

/// Whether `ip` refers to this host
pub fn is_local_ip(ip: IpAddr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() {
        return true;
    }
    UdpSocket::bind(SocketAddr::new(ip, 0)).is_ok()
}

/// Caches local/remote verdicts per peer address
#[derive(Debug)]
pub struct AddressClassifier {
    local_port: u16,
    verdicts: Mutex<HashMap<String, bool>>,
}

impl AddressClassifier {
    /// `local_port` is the port this node's forwarding server listens on
    pub fn new(local_port: u16) -> Self {
        AddressClassifier {
            local_port,
            verdicts: Mutex::new(HashMap::new()),
        }
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub async fn classify(&self, address: &str) -> Destination {
        if self.is_local(address).await {
            Destination::Local
        } else {
            Destination::Remote(address.to_string())
        }
    }

    pub async fn is_local(&self, address: &str) -> bool {
        if let Some(&local) = self.verdicts.lock().get(address) {
            return local;
        }

        let peer = PeerAddress::parse(address, self.local_port);
        let verdict = if peer.port() != self.local_port {
            Some(false)
        } else {
            self.is_local_host(&peer).await
        };

        match verdict {
            Some(local) => {
                self.verdicts.lock().insert(address.to_string(), local);
                local
            }
            None => false,
        }
    }

    /// `None` when the host name does not resolve
    async fn is_local_host(&self, peer: &PeerAddress) -> Option<bool> {
        match peer.ip() {
            Some(ip) => Some(is_local_ip(ip)),
            None => match tokio::net::lookup_host((peer.host(), peer.port())).await {
                Ok(mut resolved) => Some(resolved.any(|socket| is_local_ip(socket.ip()))),
                // Unresolvable names are remote; not cached so a later lookup can succeed
                Err(_) => None,
            },
        }
    }
}
