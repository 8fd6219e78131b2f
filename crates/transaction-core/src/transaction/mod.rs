//! The transaction record and its reply-path state.
//!
//! A [`Transaction`] is shared as `Arc<Transaction>`: the table, every timer
//! entry referring to it and every thread currently working on it hold one
//! clone, and the record is freed when the last one drops. Immutable
//! identity (key, bucket, label, request, lifetime) is readable without
//! locking; the flags and the state mirror are atomics; everything the reply
//! decision touches sits behind the reentrant reply lock.

pub mod branch;
pub mod key;
pub mod reply;
pub mod state;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, ReentrantMutex};
use rvoip_sip_message::{Method, Request, Response, StatusCode};
use serde::Serialize;
use tokio::time::Instant;

use crate::callbacks::{CompletionCallback, Notice};
use crate::dispatch::Target;
use crate::timer::{Backoff, TimerSlot};
use crate::transport::Destination;

pub use branch::BranchSnapshot;
pub use key::{BranchId, MatchingOptions, TransactionKey};
pub use reply::{BranchStatus, RelayContext, RelayDecision};
pub use state::{AtomicTransactionState, TransactionState};

pub(crate) use branch::{Branch, CancelState};

/// Transaction flags, set with `fetch_or` and never cleared.
pub mod flags {
    /// `cancel()` was called; sticky
    pub const CANCELED: u32 = 1;
    /// A 6xx arrived on some branch
    pub const SIX_XX: u32 = 1 << 1;
    /// On the wait list
    pub const WAITING: u32 = 1 << 2;
    /// Removed from the table
    pub const UNLINKED: u32 = 1 << 3;
    /// `Destroyed` was fired
    pub const DESTROYED: u32 = 1 << 4;
}

/// Server side of the reply path: what was sent upstream
#[derive(Debug, Default)]
pub(crate) struct UasReply {
    pub last_status: Option<StatusCode>,
    pub final_status: Option<StatusCode>,
    pub response: Option<Response>,
    pub buffer: Option<Bytes>,
    /// Tag of locally generated replies
    pub to_tag: Option<String>,
    /// To tag of a 2xx sent by `reply`; its ACK has nowhere to go
    pub local_ok_tag: Option<String>,
    pub retr_slot: TimerSlot,
    pub backoff: Backoff,
    pub fr_slot: TimerSlot,
}

/// Everything guarded by the reply lock
#[derive(Default)]
pub(crate) struct ReplyState {
    pub uas: UasReply,
    pub branches: Vec<Branch>,
    pub relayed_branch: Option<usize>,
    /// Remaining serial-forking groups
    pub serial: VecDeque<Vec<Target>>,
    pub on_complete: Option<CompletionCallback>,
    pub wait_slot: TimerSlot,
    pub notices: Vec<Notice>,
}

impl ReplyState {
    pub fn open_branches(&self) -> usize {
        self.branches.iter().filter(|b| b.is_open()).count()
    }

    pub fn statuses(&self) -> Vec<BranchStatus> {
        self.branches.iter().map(Branch::status).collect()
    }
}

/// Tags of what went upstream, read by table matching without the reply
/// lock. Leaf lock: nothing else is acquired while it is held.
#[derive(Debug, Default)]
pub(crate) struct UpstreamTags {
    pub final_to_tag: Option<String>,
    pub ok_to_tags: Vec<String>,
}

/// A SIP transaction
pub struct Transaction {
    key: TransactionKey,
    bucket: usize,
    label: u32,
    request: Request,
    source: Option<Destination>,
    created_at: Instant,
    deadline: Instant,
    flags: AtomicU32,
    state: AtomicTransactionState,
    upstream: Mutex<UpstreamTags>,
    /// Responses that arrived while the reply state was borrowed, i.e. from
    /// inside a send on this transaction
    deferred: Mutex<Vec<DeferredResponse>>,
    pub(crate) reply: ReentrantMutex<RefCell<ReplyState>>,
}

/// A branch response waiting for the reply state to be released
pub(crate) struct DeferredResponse {
    pub branch: usize,
    pub response: Response,
    pub source: Destination,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("label", &self.label)
            .field("bucket", &self.bucket)
            .field("key", &self.key)
            .field("state", &self.state.get())
            .field("flags", &self.flags.load(Ordering::Relaxed))
            .finish()
    }
}

impl Transaction {
    /// `source` is `None` for a locally originated request.
    pub(crate) fn new(
        bucket: usize,
        label: u32,
        request: Request,
        source: Option<Destination>,
        now: Instant,
        lifetime: Duration,
    ) -> Self {
        Self {
            key: TransactionKey::from_request(&request),
            bucket,
            label,
            request,
            source,
            created_at: now,
            deadline: now + lifetime,
            flags: AtomicU32::new(0),
            state: AtomicTransactionState::new(TransactionState::Trying),
            upstream: Mutex::new(UpstreamTags::default()),
            deferred: Mutex::new(Vec::new()),
            reply: ReentrantMutex::new(RefCell::new(ReplyState::default())),
        }
    }

    pub fn key(&self) -> &TransactionKey {
        &self.key
    }

    pub fn bucket(&self) -> usize {
        self.bucket
    }

    /// Per-bucket sequence number assigned at insertion
    pub fn label(&self) -> u32 {
        self.label
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn method(&self) -> &Method {
        &self.request.method
    }

    pub fn is_invite(&self) -> bool {
        self.request.method.is_invite()
    }

    pub fn is_local(&self) -> bool {
        self.source.is_none()
    }

    /// Where the request came from; responses go back there.
    pub fn source(&self) -> Option<Destination> {
        self.source
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Absolute lifetime ceiling
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn state(&self) -> TransactionState {
        self.state.get()
    }

    pub(crate) fn state_cell(&self) -> &AtomicTransactionState {
        &self.state
    }

    /// Set `flag`; returns whether it was already set.
    pub(crate) fn set_flag(&self, flag: u32) -> bool {
        self.flags.fetch_or(flag, Ordering::AcqRel) & flag != 0
    }

    pub(crate) fn has_flag(&self, flag: u32) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    pub fn is_canceled(&self) -> bool {
        self.has_flag(flags::CANCELED)
    }

    pub fn is_linked(&self) -> bool {
        !self.has_flag(flags::UNLINKED)
    }

    /// The encoded Via branch of outgoing branch `index`
    pub fn branch_id(&self, index: usize) -> BranchId {
        BranchId::new(self.bucket, self.label, index)
    }

    /// Final status sent upstream (or delivered locally), if any
    pub fn final_status(&self) -> Option<StatusCode> {
        self.reply.lock().borrow().uas.final_status
    }

    /// Last response sent upstream
    pub fn last_response(&self) -> Option<Response> {
        self.reply.lock().borrow().uas.response.clone()
    }

    pub fn branch_count(&self) -> usize {
        self.reply.lock().borrow().branches.len()
    }

    /// The request as sent on branch `index`
    pub fn branch_request(&self, index: usize) -> Option<Request> {
        self.reply.lock().borrow().branches.get(index).map(|b| b.request.clone())
    }

    /// Index of the branch whose final reply went upstream
    pub fn relayed_branch(&self) -> Option<usize> {
        self.reply.lock().borrow().relayed_branch
    }

    pub(crate) fn sent_to_tag(&self) -> Option<String> {
        self.upstream.lock().final_to_tag.clone()
    }

    pub(crate) fn ok_to_tags(&self) -> Vec<String> {
        self.upstream.lock().ok_to_tags.clone()
    }

    /// Remember the To tag of a response that went upstream.
    pub(crate) fn record_upstream(&self, response: &Response) {
        let Some(tag) = response.to_tag() else {
            return;
        };
        let mut upstream = self.upstream.lock();
        if response.status.is_success() && !upstream.ok_to_tags.iter().any(|t| t == tag) {
            upstream.ok_to_tags.push(tag.to_string());
        }
        if response.status.is_final() && upstream.final_to_tag.is_none() {
            upstream.final_to_tag = Some(tag.to_string());
        }
    }

    pub(crate) fn defer_response(&self, branch: usize, response: Response, source: Destination) {
        self.deferred.lock().push(DeferredResponse {
            branch,
            response,
            source,
        });
    }

    pub(crate) fn take_deferred(&self) -> Vec<DeferredResponse> {
        std::mem::take(&mut *self.deferred.lock())
    }

    pub(crate) fn has_deferred(&self) -> bool {
        !self.deferred.lock().is_empty()
    }

    pub fn snapshot(&self, now: Instant) -> TransactionSnapshot {
        let guard = self.reply.lock();
        let st = guard.borrow();
        TransactionSnapshot {
            label: self.label,
            bucket: self.bucket,
            method: self.request.method.to_string(),
            call_id: self.request.call_id.clone(),
            cseq: self.request.cseq.seq,
            state: self.state.get(),
            local: self.is_local(),
            canceled: self.is_canceled(),
            waiting: self.has_flag(flags::WAITING),
            source: self.source.map(|s| s.to_string()),
            uas_status: st.uas.last_status.map(|s| s.as_u16()),
            relayed_branch: st.relayed_branch,
            age_ms: now.saturating_duration_since(self.created_at).as_millis() as u64,
            remaining_lifetime_ms: self.deadline.saturating_duration_since(now).as_millis() as u64,
            branches: st.branches.iter().map(Branch::snapshot).collect(),
        }
    }
}

/// Administrative view of a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionSnapshot {
    pub label: u32,
    pub bucket: usize,
    pub method: String,
    pub call_id: String,
    pub cseq: u32,
    pub state: TransactionState,
    pub local: bool,
    pub canceled: bool,
    pub waiting: bool,
    pub source: Option<String>,
    pub uas_status: Option<u16>,
    pub relayed_branch: Option<usize>,
    pub age_ms: u64,
    pub remaining_lifetime_ms: u64,
    pub branches: Vec<BranchSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvoip_sip_message::SimpleRequestBuilder;

    fn tx() -> Transaction {
        let request = SimpleRequestBuilder::new(Method::Invite, "sip:bob@example.com")
            .unwrap()
            .via("SIP/2.0/UDP 192.0.2.1:5060;branch=z9hG4bKtx")
            .unwrap()
            .from("<sip:alice@example.com>;tag=a")
            .unwrap()
            .to("<sip:bob@example.com>")
            .unwrap()
            .call_id("tx-1")
            .cseq(1)
            .build()
            .unwrap();
        Transaction::new(
            3,
            9,
            request,
            Some(Destination::udp("192.0.2.1:5060".parse().unwrap())),
            Instant::now(),
            Duration::from_secs(180),
        )
    }

    #[test]
    fn flags_are_sticky() {
        let tx = tx();
        assert!(!tx.is_canceled());
        assert!(!tx.set_flag(flags::CANCELED));
        assert!(tx.set_flag(flags::CANCELED));
        assert!(tx.is_canceled());
        assert!(!tx.has_flag(flags::SIX_XX));
    }

    #[test]
    fn identity() {
        let tx = tx();
        assert!(tx.is_invite());
        assert!(!tx.is_local());
        assert_eq!(tx.branch_id(2).encode(), "z9hG4bK3.9.2");
        assert_eq!(tx.state(), TransactionState::Trying);
        let snap = tx.snapshot(tx.created_at() + Duration::from_secs(1));
        assert_eq!(snap.age_ms, 1000);
        assert_eq!(snap.remaining_lifetime_ms, 179_000);
        assert!(snap.branches.is_empty());
    }

    #[test]
    fn upstream_tags() {
        let tx = tx();
        let ok = Response::from_request(tx.request(), StatusCode::OK, None).with_to_tag("one");
        tx.record_upstream(&ok);
        tx.record_upstream(&ok.clone().with_to_tag("two"));
        assert_eq!(tx.ok_to_tags(), vec!["one".to_string(), "two".to_string()]);
        assert_eq!(tx.sent_to_tag().as_deref(), Some("one"));
    }
}
