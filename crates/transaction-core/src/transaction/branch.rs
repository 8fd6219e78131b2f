use bytes::Bytes;
use rvoip_sip_message::{Request, Response, StatusCode};
use serde::Serialize;
use tokio::time::Instant;

use super::reply::BranchStatus;
use crate::dispatch::Target;
use crate::timer::{Backoff, TimerSlot};
use crate::transport::Destination;

/// CANCEL sent (or to be sent) on a branch
#[derive(Debug)]
pub(crate) struct CancelState {
    pub buffer: Bytes,
    pub slot: TimerSlot,
    pub backoff: Backoff,
    pub started_at: Instant,
    pub replied: bool,
}

/// One outgoing copy of a transaction's request.
#[derive(Debug)]
pub(crate) struct Branch {
    pub index: usize,
    pub target: Target,
    /// Where the request went; `None` when no address could be used
    pub destination: Option<Destination>,
    /// Addresses not tried yet, in order
    pub failover: Vec<Destination>,
    pub request: Request,
    pub buffer: Bytes,
    pub last_code: Option<StatusCode>,
    pub final_code: Option<StatusCode>,
    /// Last reply received (or synthesized) on this branch
    pub reply: Option<Response>,
    pub retr_slot: TimerSlot,
    pub backoff: Backoff,
    pub fr_slot: TimerSlot,
    pub canceled: bool,
    pub timed_out: bool,
    pub received_any_reply: bool,
    pub cancel_pending: bool,
    pub cancel: Option<CancelState>,
    /// Hop-by-hop ACK sent for a negative final reply
    pub ack: Option<Bytes>,
}

impl Branch {
    pub fn new(index: usize, target: Target, request: Request, buffer: Bytes) -> Self {
        Self {
            index,
            target,
            destination: None,
            failover: Vec::new(),
            request,
            buffer,
            last_code: None,
            final_code: None,
            reply: None,
            retr_slot: TimerSlot::new(),
            backoff: Backoff::new(),
            fr_slot: TimerSlot::new(),
            canceled: false,
            timed_out: false,
            received_any_reply: false,
            cancel_pending: false,
            cancel: None,
            ack: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.final_code.is_none()
    }

    pub fn got_provisional(&self) -> bool {
        self.last_code.is_some_and(|c| c.is_provisional())
    }

    pub fn status(&self) -> BranchStatus {
        BranchStatus {
            last_code: self.last_code,
            final_code: self.final_code,
        }
    }

    pub fn snapshot(&self) -> BranchSnapshot {
        BranchSnapshot {
            index: self.index,
            uri: self.target.uri.to_string(),
            destination: self.destination.map(|d| d.to_string()),
            last_code: self.last_code.map(|c| c.as_u16()),
            final_code: self.final_code.map(|c| c.as_u16()),
            canceled: self.canceled,
            timed_out: self.timed_out,
            cancel_sent: self.cancel.is_some(),
        }
    }
}

/// Administrative view of a branch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BranchSnapshot {
    pub index: usize,
    pub uri: String,
    pub destination: Option<String>,
    pub last_code: Option<u16>,
    pub final_code: Option<u16>,
    pub canceled: bool,
    pub timed_out: bool,
    pub cancel_sent: bool,
}
