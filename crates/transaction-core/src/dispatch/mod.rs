//! Forking / UAC dispatch support
//!
//! The dispatch operations themselves live on
//! [`TransactionManager`](crate::manager::TransactionManager) because they
//! need the table, timers and transport. This module holds the parts that
//! do not: targets, destination resolution, serial-forking groups and the
//! construction of outgoing requests (branch copies, CANCEL, hop-by-hop ACK).

pub mod build;
pub mod resolver;
pub mod serial;

use std::str::FromStr;

use rvoip_sip_message::{Request, Uri};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::transport::Destination;

pub use build::PLACEHOLDER_HOST;
pub use resolver::{Resolver, StaticResolver};
pub use serial::group_by_q;

/// One destination of a request: the new Request-URI, an optional next hop
/// overriding where the request is physically sent, and a q-value for
/// serial forking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub uri: Uri,
    pub next_hop: Option<Uri>,
    pub q: Option<f32>,
}

impl Target {
    pub fn new(uri: Uri) -> Self {
        Self {
            uri,
            next_hop: None,
            q: None,
        }
    }

    pub fn parse(uri: &str) -> Result<Self> {
        Ok(Self::new(Uri::from_str(uri)?))
    }

    pub fn with_next_hop(mut self, next_hop: Uri) -> Self {
        self.next_hop = Some(next_hop);
        self
    }

    pub fn with_q(mut self, q: f32) -> Self {
        self.q = Some(q);
        self
    }

    /// The target of a request sent as-is: its Request-URI, routed through
    /// the first Route entry when that one is a loose router. Without `lr`
    /// the Request-URI already names the strict router to send to.
    pub fn from_request(request: &Request) -> Self {
        Self {
            uri: request.uri.clone(),
            next_hop: request
                .route
                .first()
                .filter(|r| r.uri.is_loose_route())
                .map(|r| r.uri.clone()),
            q: None,
        }
    }

    /// The URI that is resolved to find the destination.
    pub fn route_uri(&self) -> &Uri {
        self.next_hop.as_ref().unwrap_or(&self.uri)
    }
}

/// Result of dispatching one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchOutcome {
    /// Handed to the transport
    Sent { branch: usize, destination: Destination },
    /// Every address failed or was flagged; a synthetic 503 was recorded.
    Failed { branch: usize, reason: String },
}

impl BranchOutcome {
    pub fn branch(&self) -> usize {
        match self {
            BranchOutcome::Sent { branch, .. } | BranchOutcome::Failed { branch, .. } => *branch,
        }
    }

    pub fn is_sent(&self) -> bool {
        matches!(self, BranchOutcome::Sent { .. })
    }
}
