//! # Transaction Manager
//!
//! The [`TransactionManager`] is the engine's single entry point. It owns the
//! transaction table, the timer lists, the destination health cache and the
//! event registry, and holds the capabilities it was built with (transport,
//! resolver, optional dialog consumer).
//!
//! ```text
//!             on_request / on_response              reply / dispatch / cancel
//!                     │                                       │
//!                     ▼                                       ▼
//!   +-----------------------------------------------------------------+
//!   |                      TransactionManager                          |
//!   |  table ── transactions ── branches      timers ── on_tick()      |
//!   |  blacklist              events ── listeners / subscribers        |
//!   +-----------------------------------------------------------------+
//!                     │                                       │
//!                     ▼                                       ▼
//!              Transport::send                        DialogConsumer
//! ```
//!
//! ## Request side (UAS)
//!
//! [`on_request`](TransactionManager::on_request) runs the protocol checks,
//! then matches the request against the table. A new request creates a
//! transaction and fires `RequestIn`; a retransmission gets the last response
//! resent; ACK and CANCEL never create state. The application answers with
//! [`reply`](TransactionManager::reply) and/or forks the request with
//! [`dispatch`](TransactionManager::dispatch).
//!
//! ## Response side (UAC)
//!
//! Every request the engine sends carries a Via branch encoding
//! `(bucket, label, branch)`. [`on_response`](TransactionManager::on_response)
//! decodes it, records the reply on its branch and runs the relay decision:
//! provisionals and the first 2xx go upstream at once, negative finals are
//! held until every branch completed and the best one is picked.
//!
//! ## Timers
//!
//! Nothing in the manager sleeps. [`on_tick`](TransactionManager::on_tick)
//! pops every expired timer and runs its handler; a
//! [`TimerDriver`](crate::timer::TimerDriver) calls it periodically.
//!
//! ## Locking
//!
//! Each transaction's reply path is behind a reentrant lock. Internal
//! `*_locked` helpers work on the borrowed reply state; events queued while
//! it is borrowed are fired only after the borrow ends, so listeners may call
//! back into the manager for the same transaction.

mod relay;
mod timers;
mod uac;
mod uas;

use std::cell::RefCell;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::ReentrantMutexGuard;
use rvoip_sip_message::{Request, Response};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::blacklist::DestinationHealthCache;
use crate::callbacks::{CallbackAction, EventKind, EventRecord, EventRegistry, Notice, TransactionEvent};
use crate::config::TmConfig;
use crate::dialog::DialogConsumer;
use crate::dispatch::{Resolver, StaticResolver};
use crate::error::Result;
use crate::stats::{StatsSnapshot, TmStats};
use crate::table::TransactionTable;
use crate::timer::{Clock, SystemClock, TimerManager, TimerSettings, TimerSlot};
use crate::transaction::{MatchingOptions, ReplyState, Transaction, TransactionSnapshot, TransactionState};
use crate::transport::Transport;

pub use timers::AppTimer;
pub use uac::LocalRequest;
pub use uas::{RequestOutcome, ResponseOutcome};

pub(crate) use timers::TimerPayload;

type ReplyGuard<'a> = ReentrantMutexGuard<'a, RefCell<ReplyState>>;

pub(crate) struct ManagerInner {
    config: TmConfig,
    table: TransactionTable,
    timers: TimerManager<TimerPayload>,
    blacklist: DestinationHealthCache,
    transport: Arc<dyn Transport>,
    resolver: Arc<dyn Resolver>,
    events: EventRegistry,
    dialog_consumer: Option<Arc<dyn DialogConsumer>>,
    stats: TmStats,
    clock: Arc<dyn Clock>,
    /// Prefix of locally generated To tags
    tag_seed: String,
}

/// The SIP transaction engine. Cheap to clone; clones share one engine.
#[derive(Clone)]
pub struct TransactionManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("transactions", &self.inner.table.len())
            .field("timers", &self.inner.timers.len())
            .field("blacklist", &self.inner.blacklist)
            .field("events", &self.inner.events)
            .finish()
    }
}

/// Builder for [`TransactionManager`]
pub struct TransactionManagerBuilder {
    transport: Arc<dyn Transport>,
    config: TmConfig,
    resolver: Option<Arc<dyn Resolver>>,
    clock: Option<Arc<dyn Clock>>,
    dialog_consumer: Option<Arc<dyn DialogConsumer>>,
}

impl TransactionManagerBuilder {
    pub fn config(mut self, config: TmConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to a [`StaticResolver`] with an empty host table, which only
    /// resolves IP literals.
    pub fn resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Defaults to [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn dialog_consumer(mut self, consumer: Arc<dyn DialogConsumer>) -> Self {
        self.dialog_consumer = Some(consumer);
        self
    }

    pub fn build(self) -> Result<TransactionManager> {
        self.config.validate()?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let config = self.config;

        let mut hasher = DefaultHasher::new();
        config.server_signature.hash(&mut hasher);
        let tag_seed = format!("{:08x}", hasher.finish() as u32);

        let inner = ManagerInner {
            table: TransactionTable::new(config.table_buckets, MatchingOptions::from_config(&config)),
            timers: TimerManager::new(clock.clone()),
            blacklist: DestinationHealthCache::new(config.blacklist.clone(), clock.clone()),
            transport: self.transport,
            resolver: self.resolver.unwrap_or_else(|| Arc::new(StaticResolver::new())),
            events: EventRegistry::new(),
            dialog_consumer: self.dialog_consumer,
            stats: TmStats::new(),
            clock,
            tag_seed,
            config,
        };
        info!(
            mode = ?inner.config.matching_mode,
            buckets = inner.table.bucket_count(),
            max_branches = inner.config.max_branches,
            "transaction manager started"
        );
        Ok(TransactionManager { inner: Arc::new(inner) })
    }
}

impl TransactionManager {
    pub fn builder(transport: Arc<dyn Transport>) -> TransactionManagerBuilder {
        TransactionManagerBuilder {
            transport,
            config: TmConfig::default(),
            resolver: None,
            clock: None,
            dialog_consumer: None,
        }
    }

    /// A manager with the given configuration and default collaborators.
    pub fn new(transport: Arc<dyn Transport>, config: TmConfig) -> Result<Self> {
        Self::builder(transport).config(config).build()
    }

    pub fn config(&self) -> &TmConfig {
        &self.inner.config
    }

    fn settings(&self) -> &TimerSettings {
        &self.inner.config.timers
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub fn events(&self) -> &EventRegistry {
        &self.inner.events
    }

    /// Register a listener for `kind`.
    pub fn on<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn(&TransactionEvent<'_>) -> CallbackAction + Send + Sync + 'static,
    {
        self.inner.events.on(kind, listener);
    }

    /// Event stream of the given kinds (all kinds when empty).
    pub fn subscribe(&self, kinds: &[EventKind]) -> mpsc::UnboundedReceiver<EventRecord> {
        self.inner.events.subscribe(kinds)
    }

    pub fn blacklist(&self) -> &DestinationHealthCache {
        &self.inner.blacklist
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn transaction_count(&self) -> usize {
        self.inner.table.len()
    }

    pub fn find_transaction(&self, bucket: usize, label: u32) -> Option<Arc<Transaction>> {
        self.inner.table.find_by_label(bucket, label)
    }

    pub(crate) fn table_snapshot(&self, now: tokio::time::Instant) -> Vec<TransactionSnapshot> {
        self.inner.table.snapshot(now)
    }

    /// Number of scheduled timer entries
    pub fn pending_timers(&self) -> usize {
        self.inner.timers.len()
    }

    /// Check and repair the timer lists; returns the number repaired.
    pub fn verify_timers(&self) -> usize {
        self.inner.timers.verify()
    }

    /// Drop every transaction and timer. Pending completion callbacks are
    /// not invoked.
    pub fn shutdown(&self) {
        let timers = self.inner.timers.clear().len();
        let transactions = self.inner.table.clear();
        for tx in &transactions {
            tx.state_cell().terminate();
        }
        info!(timers, transactions = transactions.len(), "transaction manager shut down");
    }

    pub(crate) fn now(&self) -> tokio::time::Instant {
        self.inner.clock.now()
    }

    /// Time left before `tx` hits its lifetime ceiling, capped at `delay`.
    fn clamp_to_deadline(&self, tx: &Transaction, delay: Duration) -> Duration {
        delay.min(tx.deadline().saturating_duration_since(self.now()))
    }

    fn generate_to_tag(&self) -> String {
        format!("{}.{:08x}", self.inner.tag_seed, rand::random::<u32>())
    }

    /// Move `tx` to `next`; refused transitions are logged and ignored.
    fn advance(&self, tx: &Transaction, next: TransactionState) {
        if let Err(e) = tx.state_cell().transition(next) {
            debug!(label = tx.label(), error = %e, "state transition refused");
        }
    }

    fn fire_event(
        &self,
        tx: &Arc<Transaction>,
        kind: EventKind,
        branch: Option<usize>,
        request: Option<&Request>,
        response: Option<&Response>,
    ) -> CallbackAction {
        self.inner.events.fire(&TransactionEvent {
            kind,
            transaction: tx,
            request,
            response,
            branch,
        })
    }

    /// Perform the work queued while the reply state was borrowed, then
    /// the responses deferred meanwhile. Must be called with the reply lock
    /// held and no borrow outstanding.
    fn flush_notices(&self, tx: &Arc<Transaction>, guard: &ReplyGuard<'_>) {
        loop {
            let notices = std::mem::take(&mut guard.borrow_mut().notices);
            if notices.is_empty() {
                let deferred = tx.take_deferred();
                if deferred.is_empty() {
                    return;
                }
                for queued in deferred {
                    self.deliver_response(tx, guard, queued.branch, queued.response, queued.source);
                }
                continue;
            }
            for notice in notices {
                match notice {
                    Notice::Event {
                        kind,
                        branch,
                        request,
                        response,
                    } => {
                        self.fire_event(tx, kind, branch, request.as_ref(), response.as_ref());
                    }
                    Notice::Completion { callback, response } => {
                        trace!(label = tx.label(), status = response.status.as_u16(), "completion callback");
                        callback(tx, &response);
                    }
                    Notice::DialogResponse(response) => {
                        if let Some(consumer) = &self.inner.dialog_consumer {
                            consumer.on_dialog_response(tx, &response);
                        }
                    }
                }
            }
        }
    }

    /// Arm (or re-arm) the slot that removes `tx` once its lifetime ends.
    fn arm_lifetime_locked(&self, tx: &Arc<Transaction>, slot: &mut TimerSlot) {
        let lifetime = self.clamp_to_deadline(tx, self.settings().max_lifetime(tx.is_invite()));
        self.inner.timers.schedule(
            slot,
            crate::timer::ListId::General,
            lifetime,
            TimerPayload::Wait { tx: tx.clone() },
        );
    }
}
