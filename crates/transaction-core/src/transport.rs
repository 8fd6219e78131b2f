//! The outbound capability the engine needs from the transport layer.
//!
//! Sending is synchronous and non-blocking from the engine's point of view:
//! `send` reports whether the local send succeeded, nothing more. Waiting for
//! the protocol answer is the job of the timers.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transport protocol of a destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Protocol {
    /// Wildcard, only meaningful as a destination-health lookup key
    Any,
    Udp,
    Tcp,
    Tls,
    Sctp,
    Ws,
    Wss,
}

impl Protocol {
    /// Reliable transports need no retransmission from the transaction layer.
    pub fn is_reliable(&self) -> bool {
        !matches!(self, Protocol::Udp | Protocol::Any)
    }

    /// Token used in Via headers
    pub fn via_token(&self) -> &'static str {
        match self {
            Protocol::Any | Protocol::Udp => "UDP",
            Protocol::Tcp => "TCP",
            Protocol::Tls => "TLS",
            Protocol::Sctp => "SCTP",
            Protocol::Ws => "WS",
            Protocol::Wss => "WSS",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Any => f.write_str("any"),
            other => f.write_str(&other.via_token().to_ascii_lowercase()),
        }
    }
}

impl FromStr for Protocol {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "any" | "*" => Ok(Protocol::Any),
            "udp" => Ok(Protocol::Udp),
            "tcp" => Ok(Protocol::Tcp),
            "tls" => Ok(Protocol::Tls),
            "sctp" => Ok(Protocol::Sctp),
            "ws" => Ok(Protocol::Ws),
            "wss" => Ok(Protocol::Wss),
            _ => Err(TransportError::UnsupportedProtocol(s.to_string())),
        }
    }
}

/// A concrete transport-level destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub protocol: Protocol,
    pub addr: SocketAddr,
}

impl Destination {
    pub fn new(protocol: Protocol, addr: SocketAddr) -> Self {
        Self { protocol, addr }
    }

    pub fn udp(addr: SocketAddr) -> Self {
        Self::new(Protocol::Udp, addr)
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.protocol, self.addr)
    }
}

/// Local send failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("send to {0} failed: {1}")]
    SendFailed(Destination, String),

    #[error("connection to {0} failed")]
    ConnectFailed(Destination),

    #[error("no listening socket for {0}")]
    NoSocket(Protocol),

    #[error("unsupported transport protocol: {0}")]
    UnsupportedProtocol(String),
}

/// Outbound transport capability
///
/// Must be callable from any worker thread and must not block. `send` may
/// feed responses back into the engine before returning; a response for the
/// transaction being sent on is queued and handled once that send's caller
/// releases the transaction.
pub trait Transport: Send + Sync {
    /// Hand `buffer` to the socket serving `destination`.
    fn send(&self, destination: &Destination, buffer: &[u8]) -> Result<(), TransportError>;

    /// Address to advertise in Via / Contact for `protocol`.
    fn local_address(&self, protocol: Protocol) -> Option<SocketAddr>;
}
