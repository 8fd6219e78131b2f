use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use dashmap::DashMap;
use rvoip_sip_message::{Scheme, Uri};

use crate::error::{Error, Result};
use crate::transport::{Destination, Protocol};

/// Maps a URI to its ordered list of transport destinations (RFC 3263).
pub trait Resolver: Send + Sync {
    fn resolve(&self, uri: &Uri) -> Result<Vec<Destination>>;
}

/// Resolver over IP literals and a static host table.
///
/// The transport comes from the `transport` URI parameter, then from the
/// scheme (`sips` means TLS), then defaults to UDP. The port comes from the
/// URI, then from the host table entry, then defaults to 5060 (5061 for TLS).
#[derive(Debug, Default)]
pub struct StaticResolver {
    hosts: DashMap<String, Vec<SocketAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the addresses of `host`, in preference order.
    pub fn add_host(&self, host: &str, addrs: Vec<SocketAddr>) {
        self.hosts.insert(host.to_ascii_lowercase(), addrs);
    }

    pub fn remove_host(&self, host: &str) -> bool {
        self.hosts.remove(&host.to_ascii_lowercase()).is_some()
    }

    fn protocol_of(uri: &Uri) -> Result<Protocol> {
        match uri.transport_param() {
            Some(transport) => Ok(Protocol::from_str(transport)?),
            None if uri.scheme == Scheme::Sips => Ok(Protocol::Tls),
            None => Ok(Protocol::Udp),
        }
    }

    fn default_port(protocol: Protocol) -> u16 {
        match protocol {
            Protocol::Tls | Protocol::Wss => 5061,
            _ => 5060,
        }
    }
}

impl Resolver for StaticResolver {
    fn resolve(&self, uri: &Uri) -> Result<Vec<Destination>> {
        let protocol = Self::protocol_of(uri)?;
        if let Ok(ip) = uri.host.parse::<IpAddr>() {
            let port = uri.port.unwrap_or_else(|| Self::default_port(protocol));
            return Ok(vec![Destination::new(protocol, SocketAddr::new(ip, port))]);
        }
        let addrs = self
            .hosts
            .get(&uri.host.to_ascii_lowercase())
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        if addrs.is_empty() {
            return Err(Error::Resolution(uri.to_string()));
        }
        Ok(addrs
            .into_iter()
            .map(|addr| {
                let port = uri.port.unwrap_or(addr.port());
                Destination::new(protocol, SocketAddr::new(addr.ip(), port))
            })
            .collect())
    }
}
