//! Timer payloads and their handlers.
//!
//! Every payload that refers to a transaction holds an `Arc` of it, which is
//! the timer's share of the reference count. A handler first takes the
//! transaction's reply lock and consumes the matching slot; a firing whose
//! handle no longer matches the slot raced with a cancel or reschedule and
//! is dropped.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rvoip_sip_message::{Response, StatusCode};
use tracing::{debug, trace, warn};

use super::TransactionManager;
use crate::blacklist::HealthFlags;
use crate::callbacks::{EventKind, Notice};
use crate::timer::{ListId, TimerHandle, TimerSlot};
use crate::transaction::{flags, Transaction};

pub(crate) enum TimerPayload {
    /// Request retransmission on a branch
    Retransmit { tx: Arc<Transaction>, branch: usize },
    /// No final response on a branch in time
    FinalResponse { tx: Arc<Transaction>, branch: usize },
    /// Retransmission of the negative final response of an INVITE
    UasRetransmit { tx: Arc<Transaction> },
    /// No ACK for the negative final response of an INVITE
    UasFinalResponse { tx: Arc<Transaction> },
    /// CANCEL retransmission on a branch
    CancelRetransmit { tx: Arc<Transaction>, branch: usize },
    /// End of the wait phase, or of the transaction's lifetime
    Wait { tx: Arc<Transaction> },
    /// Application timer
    App { callback: Box<dyn FnOnce() + Send> },
}

impl fmt::Debug for TimerPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerPayload::Retransmit { tx, branch } => write!(f, "Retransmit({}, {})", tx.label(), branch),
            TimerPayload::FinalResponse { tx, branch } => write!(f, "FinalResponse({}, {})", tx.label(), branch),
            TimerPayload::UasRetransmit { tx } => write!(f, "UasRetransmit({})", tx.label()),
            TimerPayload::UasFinalResponse { tx } => write!(f, "UasFinalResponse({})", tx.label()),
            TimerPayload::CancelRetransmit { tx, branch } => write!(f, "CancelRetransmit({}, {})", tx.label(), branch),
            TimerPayload::Wait { tx } => write!(f, "Wait({})", tx.label()),
            TimerPayload::App { .. } => f.write_str("App"),
        }
    }
}

/// Handle of an application timer; pass it to
/// [`TransactionManager::cancel_timer`].
#[derive(Debug, Default)]
pub struct AppTimer {
    slot: TimerSlot,
}

impl AppTimer {
    pub fn is_armed(&self) -> bool {
        self.slot.is_armed()
    }
}

impl TransactionManager {
    /// Run every expired timer. Returns the number of entries that fired.
    pub fn on_tick(&self) -> usize {
        let fired = self.inner.timers.tick();
        let count = fired.len();
        for (handle, payload) in fired {
            trace!(list = %handle.list(), ?payload, "timer fired");
            let tx = match payload {
                TimerPayload::Retransmit { tx, branch } => {
                    self.on_retransmit(&tx, handle, branch);
                    tx
                }
                TimerPayload::FinalResponse { tx, branch } => {
                    self.on_final_response_timeout(&tx, handle, branch);
                    tx
                }
                TimerPayload::UasRetransmit { tx } => {
                    self.on_uas_retransmit(&tx, handle);
                    tx
                }
                TimerPayload::UasFinalResponse { tx } => {
                    self.on_uas_final_response_timeout(&tx, handle);
                    tx
                }
                TimerPayload::CancelRetransmit { tx, branch } => {
                    self.on_cancel_retransmit(&tx, handle, branch);
                    tx
                }
                TimerPayload::Wait { tx } => {
                    self.on_wait(&tx, handle);
                    tx
                }
                TimerPayload::App { callback } => {
                    callback();
                    continue;
                }
            };
            self.settle_deferred(&tx);
        }
        count
    }

    /// Run `callback` once after `delay`, from `on_tick`.
    pub fn schedule_timer<F>(&self, delay: Duration, callback: F) -> AppTimer
    where
        F: FnOnce() + Send + 'static,
    {
        let mut timer = AppTimer::default();
        self.inner.timers.schedule(
            &mut timer.slot,
            ListId::General,
            delay,
            TimerPayload::App {
                callback: Box::new(callback),
            },
        );
        timer
    }

    /// Returns false when the timer already fired or was canceled.
    pub fn cancel_timer(&self, timer: &mut AppTimer) -> bool {
        self.inner.timers.cancel(&mut timer.slot).is_some()
    }

    fn on_retransmit(&self, tx: &Arc<Transaction>, handle: TimerHandle, index: usize) {
        let guard = tx.reply.lock();
        let mut st = guard.borrow_mut();
        let Some(branch) = st.branches.get_mut(index) else {
            return;
        };
        if !branch.retr_slot.consume(handle) || !branch.is_open() || tx.state().is_terminated() {
            return;
        }
        let Some(destination) = branch.destination else {
            return;
        };
        if let Err(e) = self.inner.transport.send(&destination, &branch.buffer) {
            warn!(label = tx.label(), branch = index, error = %e, "request retransmission failed");
        }
        self.inner.stats.request_retransmitted();
        let (list, delay) = branch.backoff.next(self.settings());
        self.inner.timers.schedule(
            &mut branch.retr_slot,
            list,
            delay,
            TimerPayload::Retransmit { tx: tx.clone(), branch: index },
        );
    }

    fn on_final_response_timeout(&self, tx: &Arc<Transaction>, handle: TimerHandle, index: usize) {
        let guard = tx.reply.lock();
        let timeout = {
            let mut st = guard.borrow_mut();
            let Some(branch) = st.branches.get_mut(index) else {
                return;
            };
            if !branch.fr_slot.consume(handle) || !branch.is_open() {
                return;
            }
            self.inner.timers.cancel(&mut branch.retr_slot);
            self.inner.stats.timeout();
            debug!(label = tx.label(), branch = index, replied = branch.received_any_reply, "final response timeout");

            if !branch.received_any_reply && self.inner.blacklist.config().on_timeout {
                if let Some(destination) = branch.destination {
                    if let Err(e) = self.inner.blacklist.add(HealthFlags::TIMEOUT, &destination, None) {
                        debug!(error = %e, "timeout not recorded");
                    }
                }
            }
            if tx.is_invite() && branch.got_provisional() {
                self.send_cancel_locked(tx, branch);
            }
            branch.timed_out = true;
            Response::from_request(&branch.request, StatusCode::REQUEST_TIMEOUT, None)
        };
        self.handle_branch_reply(tx, &guard, index, timeout, true);
    }

    fn on_uas_retransmit(&self, tx: &Arc<Transaction>, handle: TimerHandle) {
        let guard = tx.reply.lock();
        let mut st = guard.borrow_mut();
        if !st.uas.retr_slot.consume(handle) || tx.has_flag(flags::WAITING) {
            return;
        }
        let (Some(buffer), Some(source)) = (st.uas.buffer.clone(), tx.source()) else {
            return;
        };
        if let Err(e) = self.inner.transport.send(&source, &buffer) {
            warn!(label = tx.label(), error = %e, "response retransmission failed");
        }
        self.inner.stats.response_retransmitted();
        let (list, delay) = st.uas.backoff.next(self.settings());
        self.inner.timers.schedule(
            &mut st.uas.retr_slot,
            list,
            delay,
            TimerPayload::UasRetransmit { tx: tx.clone() },
        );
    }

    fn on_uas_final_response_timeout(&self, tx: &Arc<Transaction>, handle: TimerHandle) {
        let guard = tx.reply.lock();
        {
            let mut st = guard.borrow_mut();
            if !st.uas.fr_slot.consume(handle) {
                return;
            }
            debug!(label = tx.label(), "no ACK for negative final response");
            self.put_on_wait_locked(tx, &mut st);
        }
        self.flush_notices(tx, &guard);
    }

    fn on_cancel_retransmit(&self, tx: &Arc<Transaction>, handle: TimerHandle, index: usize) {
        let now = self.now();
        let fr_timeout = self.settings().fr_timeout;
        let guard = tx.reply.lock();
        let mut st = guard.borrow_mut();
        let Some(branch) = st.branches.get_mut(index) else {
            return;
        };
        let destination = branch.destination;
        let Some(cancel) = branch.cancel.as_mut() else {
            return;
        };
        if !cancel.slot.consume(handle) || cancel.replied {
            return;
        }
        if now.saturating_duration_since(cancel.started_at) >= fr_timeout {
            debug!(label = tx.label(), branch = index, "giving up CANCEL retransmission");
            return;
        }
        let Some(destination) = destination else {
            return;
        };
        if let Err(e) = self.inner.transport.send(&destination, &cancel.buffer) {
            warn!(label = tx.label(), branch = index, error = %e, "CANCEL retransmission failed");
        }
        self.inner.stats.request_retransmitted();
        let (list, delay) = cancel.backoff.next(self.settings());
        self.inner.timers.schedule(
            &mut cancel.slot,
            list,
            delay,
            TimerPayload::CancelRetransmit { tx: tx.clone(), branch: index },
        );
    }

    /// Remove `tx`: the wait phase ended, or its lifetime ceiling was hit.
    fn on_wait(&self, tx: &Arc<Transaction>, handle: TimerHandle) {
        let guard = tx.reply.lock();
        {
            let mut st = guard.borrow_mut();
            if !st.wait_slot.consume(handle) {
                return;
            }
            if !tx.has_flag(flags::WAITING) {
                warn!(label = tx.label(), method = %tx.method(), "transaction lifetime exceeded");
                // the previous hop still waits for a final answer
                if tx.source().is_some() && st.uas.final_status.is_none() {
                    if let Err(e) = self.reply_locked(tx, &mut st, StatusCode::REQUEST_TIMEOUT, None) {
                        debug!(label = tx.label(), error = %e, "408 not sent");
                    }
                }
                if let Some(callback) = st.on_complete.take() {
                    let timeout =
                        Response::from_request(tx.request(), StatusCode::REQUEST_TIMEOUT, None);
                    st.notices.push(Notice::Completion {
                        callback,
                        response: timeout,
                    });
                }
            }
            tx.state_cell().terminate();
            self.cancel_all_timers_locked(&mut st);
            st.serial.clear();
        }
        self.flush_notices(tx, &guard);

        let was_waiting = tx.has_flag(flags::WAITING);
        if self.inner.table.remove(tx) {
            self.inner.stats.destroyed(was_waiting);
        }
        if !tx.set_flag(flags::DESTROYED) {
            self.fire_event(tx, EventKind::Destroyed, None, None, None);
        }
    }
}
