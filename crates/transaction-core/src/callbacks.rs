//! Application callbacks on named transaction events.
//!
//! Listeners are plain closures registered per [`EventKind`]. They get read
//! access to the transaction and the message that triggered the event and
//! may ask for an outcome through the returned [`CallbackAction`]. Listeners
//! run on the thread that produced the event, with the transaction's reply
//! lock held, so they must not block; they may call back into
//! [`TransactionManager::reply`](crate::manager::TransactionManager::reply)
//! for the same transaction.
//!
//! [`EventRegistry::subscribe`] offers the same events as owned
//! [`EventRecord`]s over an unbounded tokio channel, for consumers living in
//! async tasks.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rvoip_sip_message::{Request, Response, StatusCode};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::trace;

use crate::dispatch::Target;
use crate::transaction::Transaction;

/// Named events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    /// A request created a new transaction
    RequestIn,
    /// A reply arrived on one of the transaction's branches
    ResponseIn,
    /// Every branch completed with a failure
    BranchFailure,
    /// The transaction left the table
    Destroyed,
    /// The engine sent an ACK for a locally originated INVITE
    LocalAck,
    /// A response was sent upstream
    ResponseOut,
}

/// What a listener sees
#[derive(Clone, Copy)]
pub struct TransactionEvent<'a> {
    pub kind: EventKind,
    pub transaction: &'a Arc<Transaction>,
    pub request: Option<&'a Request>,
    pub response: Option<&'a Response>,
    pub branch: Option<usize>,
}

impl fmt::Debug for TransactionEvent<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionEvent")
            .field("kind", &self.kind)
            .field("label", &self.transaction.label())
            .field("branch", &self.branch)
            .field("status", &self.response.map(|r| r.status))
            .finish()
    }
}

/// Outcome a listener may request. `Reply` is honored on `RequestIn` and
/// `BranchFailure`, `Fork` only on `BranchFailure`; anything else is ignored.
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackAction {
    Continue,
    Reply { code: StatusCode, reason: Option<String> },
    Fork(Vec<Target>),
}

pub type Listener = Arc<dyn Fn(&TransactionEvent<'_>) -> CallbackAction + Send + Sync>;

/// Completion callback of a locally originated request; receives the final
/// response, real or synthetic.
pub type CompletionCallback = Box<dyn FnOnce(&Arc<Transaction>, &Response) + Send>;

/// Owned copy of an event for stream subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventRecord {
    pub kind: EventKind,
    pub label: u32,
    pub call_id: String,
    pub method: String,
    pub status: Option<u16>,
    pub branch: Option<usize>,
}

impl EventRecord {
    fn from_event(event: &TransactionEvent<'_>) -> Self {
        let tx = event.transaction;
        Self {
            kind: event.kind,
            label: tx.label(),
            call_id: tx.request().call_id.clone(),
            method: tx.method().to_string(),
            status: event.response.map(|r| r.status.as_u16()),
            branch: event.branch,
        }
    }
}

struct Subscriber {
    kinds: Vec<EventKind>,
    sender: mpsc::UnboundedSender<EventRecord>,
}

/// Work queued while the reply state is borrowed and performed once the
/// borrow is released.
pub(crate) enum Notice {
    Event {
        kind: EventKind,
        branch: Option<usize>,
        request: Option<Request>,
        response: Option<Response>,
    },
    Completion {
        callback: CompletionCallback,
        response: Response,
    },
    DialogResponse(Response),
}

impl Notice {
    pub(crate) fn event(kind: EventKind, branch: Option<usize>, response: Option<Response>) -> Self {
        Notice::Event {
            kind,
            branch,
            request: None,
            response,
        }
    }
}

/// Listener and subscriber registry
#[derive(Default)]
pub struct EventRegistry {
    listeners: RwLock<HashMap<EventKind, Vec<Listener>>>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners: usize = self.listeners.read().values().map(Vec::len).sum();
        f.debug_struct("EventRegistry")
            .field("listeners", &listeners)
            .field("subscribers", &self.subscribers.lock().len())
            .finish()
    }
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: EventKind, listener: Listener) {
        self.listeners.write().entry(kind).or_default().push(listener);
    }

    /// Register a closure for `kind`.
    pub fn on<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn(&TransactionEvent<'_>) -> CallbackAction + Send + Sync + 'static,
    {
        self.register(kind, Arc::new(listener));
    }

    pub fn has_listeners(&self, kind: EventKind) -> bool {
        self.listeners.read().get(&kind).is_some_and(|l| !l.is_empty())
    }

    /// Stream of owned records for the given kinds (all kinds when empty).
    pub fn subscribe(&self, kinds: &[EventKind]) -> mpsc::UnboundedReceiver<EventRecord> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.lock().push(Subscriber {
            kinds: kinds.to_vec(),
            sender,
        });
        receiver
    }

    /// Run every listener of the event's kind and publish the record. The
    /// first action other than `Continue` is returned; later listeners still
    /// run.
    pub fn fire(&self, event: &TransactionEvent<'_>) -> CallbackAction {
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .get(&event.kind)
            .cloned()
            .unwrap_or_default();

        let mut action = CallbackAction::Continue;
        for listener in listeners {
            let requested = listener(event);
            if action == CallbackAction::Continue {
                action = requested;
            }
        }

        let mut subscribers = self.subscribers.lock();
        if !subscribers.is_empty() {
            let record = EventRecord::from_event(event);
            subscribers.retain(|s| {
                if !s.kinds.is_empty() && !s.kinds.contains(&event.kind) {
                    return !s.sender.is_closed();
                }
                s.sender.send(record.clone()).is_ok()
            });
        }
        trace!(label = event.transaction.label(), kind = ?event.kind, "event fired");
        action
    }
}
