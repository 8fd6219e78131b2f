//! Reply processing on outgoing branches and relaying upstream.
//!
//! [`handle_branch_reply`](TransactionManager::handle_branch_reply) is the
//! one path every reply takes, real or synthetic (408 on timeout, 503 when a
//! branch could not be sent). It records the reply on its branch, runs the
//! relay decision and, once every branch failed, gives serial forking and
//! `BranchFailure` listeners a chance to add branches before the best final
//! reply goes upstream.

use std::collections::VecDeque;
use std::sync::Arc;

use rvoip_sip_message::{Response, StatusCode};
use tracing::{debug, error, warn};

use super::{ReplyGuard, TimerPayload, TransactionManager};
use crate::blacklist::HealthFlags;
use crate::callbacks::{CallbackAction, EventKind, Notice};
use crate::dispatch::{build, BranchOutcome, Target};
use crate::timer::ListId;
use crate::transaction::{flags, reply, CancelState, RelayContext, RelayDecision, ReplyState, Transaction, TransactionState};

/// One unit of reply processing
pub(super) enum Work {
    /// Record a reply on a branch, then evaluate it
    Reply { branch: usize, response: Response, synthetic: bool },
    /// Re-run the decision for a branch that already holds its final reply
    Evaluate(usize),
}

/// Result of a processing step
pub(super) enum Step {
    Done,
    AllFailed { picked: usize, six_xx: bool },
}

impl TransactionManager {
    pub(super) fn handle_branch_reply(
        &self,
        tx: &Arc<Transaction>,
        guard: &ReplyGuard<'_>,
        branch: usize,
        response: Response,
        synthetic: bool,
    ) {
        self.process_replies(
            tx,
            guard,
            Work::Reply {
                branch,
                response,
                synthetic,
            },
        );
    }

    /// Drive `first` and everything it leads to. Failure listeners run at
    /// most once per call.
    pub(super) fn process_replies(&self, tx: &Arc<Transaction>, guard: &ReplyGuard<'_>, first: Work) {
        let mut queue = VecDeque::from([first]);
        let mut listeners_allowed = true;

        while let Some(work) = queue.pop_front() {
            let step = {
                let mut st = guard.borrow_mut();
                match work {
                    Work::Reply {
                        branch,
                        response,
                        synthetic,
                    } => self.branch_reply_locked(tx, &mut st, branch, response, synthetic),
                    Work::Evaluate(branch) => match st.branches.get(branch).and_then(|b| b.final_code) {
                        Some(code) => self.evaluate_locked(tx, &mut st, branch, code),
                        None => Step::Done,
                    },
                }
            };
            self.flush_notices(tx, guard);

            let Step::AllFailed { picked, six_xx } = step else {
                continue;
            };

            if !six_xx {
                let group = {
                    let mut st = guard.borrow_mut();
                    if tx.is_canceled() {
                        st.serial.clear();
                        None
                    } else {
                        st.serial.pop_front()
                    }
                };
                if let Some(group) = group {
                    debug!(label = tx.label(), targets = group.len(), "next serial group");
                    if let Some(next) = self.fork_more(tx, guard, &group) {
                        queue.extend(next);
                        continue;
                    }
                }

                if listeners_allowed && self.inner.events.has_listeners(EventKind::BranchFailure) {
                    listeners_allowed = false;
                    let failed = guard.borrow().branches.get(picked).and_then(|b| b.reply.clone());
                    let action = self.fire_event(tx, EventKind::BranchFailure, Some(picked), None, failed.as_ref());
                    match action {
                        CallbackAction::Reply { code, reason } => {
                            if let Err(e) = self.reply_guarded(tx, guard, code, reason.as_deref()) {
                                warn!(label = tx.label(), error = %e, "failure listener reply not sent");
                            }
                            continue;
                        }
                        CallbackAction::Fork(targets) => {
                            if let Some(next) = self.fork_more(tx, guard, &targets) {
                                queue.extend(next);
                                continue;
                            }
                        }
                        CallbackAction::Continue => {}
                    }
                }
            }

            {
                let mut st = guard.borrow_mut();
                self.relay_final_locked(tx, &mut st, picked);
            }
            self.flush_notices(tx, guard);
        }
    }

    /// Add branches for `targets` after every branch failed. `None` when no
    /// branch could be added and the caller should relay what it has;
    /// otherwise the follow-up work (empty when a branch is in flight).
    fn fork_more(&self, tx: &Arc<Transaction>, guard: &ReplyGuard<'_>, targets: &[Target]) -> Option<Vec<Work>> {
        let added = {
            let mut st = guard.borrow_mut();
            self.add_branches_locked(tx, &mut st, targets)
        };
        self.flush_notices(tx, guard);
        match added {
            Ok(outcomes) if outcomes.is_empty() => None,
            Ok(outcomes) if outcomes.iter().any(BranchOutcome::is_sent) => Some(Vec::new()),
            Ok(outcomes) => outcomes.last().map(|o| vec![Work::Evaluate(o.branch())]),
            Err(e) => {
                warn!(label = tx.label(), error = %e, "could not add branches");
                None
            }
        }
    }

    /// Record `response` on branch `index` and evaluate it.
    pub(super) fn branch_reply_locked(
        &self,
        tx: &Arc<Transaction>,
        st: &mut ReplyState,
        index: usize,
        response: Response,
        synthetic: bool,
    ) -> Step {
        let settings = self.settings().clone();
        let now = self.now();
        let code = response.status;
        let Some(branch) = st.branches.get_mut(index) else {
            error!(invariant = "branch_exists", label = tx.label(), branch = index, "reply for unknown branch");
            return Step::Done;
        };

        if let Some(previous) = branch.final_code {
            if !(tx.is_invite() && code.is_success()) {
                if code.is_final() && tx.is_invite() && !synthetic {
                    self.ack_branch(tx, branch, &response);
                }
                return Step::Done;
            }
            if previous.is_success() {
                // 2xx retransmission: end-to-end, never absorbed here
                match tx.source() {
                    Some(source) => {
                        let upstream = build::upstream_response(&response);
                        if let Err(e) = self.inner.transport.send(&source, &upstream.to_bytes()) {
                            warn!(label = tx.label(), error = %e, "2xx retransmission not forwarded");
                        }
                    }
                    None => st.notices.push(Notice::DialogResponse(response)),
                }
                return Step::Done;
            }
            debug!(label = tx.label(), branch = index, previous = previous.as_u16(), "2xx after negative final");
        }

        if tx.is_invite() || code.is_final() {
            self.inner.timers.cancel(&mut branch.retr_slot);
        } else if branch.retr_slot.is_armed() {
            branch.backoff.hold_at_t2();
            let (list, delay) = branch.backoff.next(&settings);
            self.inner.timers.schedule(
                &mut branch.retr_slot,
                list,
                delay,
                TimerPayload::Retransmit { tx: tx.clone(), branch: index },
            );
        }
        let first_provisional = code.is_provisional() && !branch.got_provisional() && branch.final_code.is_none();
        if !synthetic {
            branch.received_any_reply = true;
        }

        if code.is_provisional() {
            if tx.is_invite() && first_provisional && settings.restart_fr_on_provisional && branch.fr_slot.is_armed() {
                let delay = settings
                    .fr_inv_timeout
                    .min(tx.deadline().saturating_duration_since(now));
                self.inner.timers.schedule(
                    &mut branch.fr_slot,
                    ListId::FinalResponseInvite,
                    delay,
                    TimerPayload::FinalResponse { tx: tx.clone(), branch: index },
                );
            }
            branch.last_code = Some(code);
            branch.reply = Some(response);
            if branch.cancel_pending && tx.is_invite() {
                branch.cancel_pending = false;
                self.send_cancel_locked(tx, branch);
            }
            return self.evaluate_locked(tx, st, index, code);
        }

        self.inner.timers.cancel(&mut branch.fr_slot);
        branch.last_code = Some(code);
        branch.final_code = Some(code);
        branch.cancel_pending = false;
        if tx.is_invite() && !code.is_success() && !synthetic {
            self.ack_branch(tx, branch, &response);
            if tx.is_local() {
                let ack = build::ack_request(&branch.request, &response);
                st.notices.push(Notice::Event {
                    kind: EventKind::LocalAck,
                    branch: Some(index),
                    request: Some(ack),
                    response: Some(response.clone()),
                });
            }
        }

        let Some(branch) = st.branches.get_mut(index) else {
            return Step::Done;
        };
        if code == StatusCode::SERVICE_UNAVAILABLE && !synthetic && self.inner.blacklist.config().on_503 {
            if let Some(destination) = branch.destination {
                let quarantine = response.retry_after().map(|s| std::time::Duration::from_secs(u64::from(s)));
                if let Err(e) = self.inner.blacklist.add(HealthFlags::ERR_503, &destination, quarantine) {
                    debug!(error = %e, "503 not recorded");
                }
            }
        }

        let wants_failover = self.inner.config.use_dns_failover
            && !tx.is_canceled()
            && !branch.failover.is_empty()
            && ((code == StatusCode::REQUEST_TIMEOUT && !branch.received_any_reply)
                || (code == StatusCode::SERVICE_UNAVAILABLE && response.retry_after().is_some()));
        let failover = if wants_failover && st.branches.len() < self.inner.config.max_branches {
            let branch = &mut st.branches[index];
            Some((branch.target.clone(), std::mem::take(&mut branch.failover)))
        } else {
            None
        };
        st.branches[index].reply = Some(response);

        if let Some((target, addresses)) = failover {
            debug!(label = tx.label(), branch = index, code = code.as_u16(), left = addresses.len(), "DNS failover");
            self.inner.stats.dns_failover();
            match build::next_max_forwards(tx.request(), tx.is_local()) {
                Ok(hops) => {
                    self.start_branch_locked(tx, st, target, addresses, hops);
                }
                Err(e) => warn!(label = tx.label(), error = %e, "failover branch not started"),
            }
        }

        self.evaluate_locked(tx, st, index, code)
    }

    /// Send (or resend) the hop-by-hop ACK for a negative final reply.
    fn ack_branch(&self, tx: &Transaction, branch: &mut crate::transaction::Branch, response: &Response) {
        let Some(destination) = branch.destination else {
            return;
        };
        let buffer = match &branch.ack {
            Some(buffer) => buffer.clone(),
            None => {
                let buffer = build::ack_request(&branch.request, response).to_bytes();
                branch.ack = Some(buffer.clone());
                buffer
            }
        };
        if let Err(e) = self.inner.transport.send(&destination, &buffer) {
            warn!(label = tx.label(), branch = branch.index, error = %e, "ACK not sent");
        }
    }

    /// Run the relay decision for `code` on branch `index`.
    pub(super) fn evaluate_locked(
        &self,
        tx: &Arc<Transaction>,
        st: &mut ReplyState,
        index: usize,
        code: StatusCode,
    ) -> Step {
        let ctx = RelayContext {
            is_invite: tx.is_invite(),
            uas_final: st.uas.final_status.is_some(),
            six_xx: tx.has_flag(flags::SIX_XX),
            canceled: tx.is_canceled(),
        };
        match reply::decide(ctx, &st.statuses(), index, code) {
            RelayDecision::Discard => Step::Done,
            RelayDecision::Store { cancel_others, six_xx } => {
                if six_xx {
                    tx.set_flag(flags::SIX_XX);
                }
                if cancel_others {
                    self.cancel_branches_locked(tx, st, Some(index));
                }
                Step::Done
            }
            RelayDecision::Provisional => {
                if let Some(response) = st.branches[index].reply.clone() {
                    self.relay_locked(tx, st, Some(index), response);
                }
                Step::Done
            }
            RelayDecision::Success => {
                self.cancel_branches_locked(tx, st, Some(index));
                if let Some(response) = st.branches[index].reply.clone() {
                    self.relay_locked(tx, st, Some(index), response);
                }
                Step::Done
            }
            RelayDecision::AllFailed { picked, six_xx } => {
                if six_xx {
                    tx.set_flag(flags::SIX_XX);
                }
                Step::AllFailed { picked, six_xx }
            }
        }
    }

    /// Relay the final reply held by branch `picked`.
    fn relay_final_locked(&self, tx: &Arc<Transaction>, st: &mut ReplyState, picked: usize) {
        if st.uas.final_status.is_some() {
            return;
        }
        let Some(mut response) = st.branches.get(picked).and_then(|b| b.reply.clone()) else {
            error!(invariant = "picked_branch_has_reply", label = tx.label(), branch = picked, "picked branch holds no reply");
            return;
        };
        let code = reply::relayed_code(response.status);
        if code != response.status {
            response.status = code;
            response.reason = code.reason_phrase().to_string();
        }
        debug!(label = tx.label(), branch = picked, status = code.as_u16(), "relaying picked final reply");
        self.relay_locked(tx, st, Some(picked), response);
    }

    /// Send `response` upstream (or deliver it locally) and move the
    /// transaction on. A 2xx after the transaction completed is pushed
    /// without touching the stored reply.
    pub(super) fn relay_locked(
        &self,
        tx: &Arc<Transaction>,
        st: &mut ReplyState,
        branch: Option<usize>,
        response: Response,
    ) {
        let code = response.status;
        let pushed = st.uas.final_status.is_some();

        match tx.source() {
            Some(source) => {
                let upstream = build::upstream_response(&response);
                let buffer = upstream.to_bytes();
                if let Err(e) = self.inner.transport.send(&source, &buffer) {
                    warn!(label = tx.label(), status = code.as_u16(), error = %e, "relayed reply not sent");
                }
                tx.record_upstream(&upstream);
                self.inner.stats.relayed(code.class());
                if !pushed {
                    st.uas.last_status = Some(code);
                    st.uas.response = Some(upstream.clone());
                    st.uas.buffer = Some(buffer);
                }
                st.notices.push(Notice::event(EventKind::ResponseOut, branch, Some(upstream)));
            }
            None => {
                if !pushed {
                    st.uas.last_status = Some(code);
                    st.uas.response = Some(response.clone());
                }
                if self.inner.dialog_consumer.is_some() && (code.is_final() || response.to_tag().is_some()) {
                    st.notices.push(Notice::DialogResponse(response.clone()));
                }
                if code.is_final() && !pushed {
                    if let Some(callback) = st.on_complete.take() {
                        st.notices.push(Notice::Completion {
                            callback,
                            response: response.clone(),
                        });
                    }
                }
            }
        }

        if pushed {
            return;
        }
        if code.is_provisional() {
            self.advance(tx, TransactionState::Proceeding);
            return;
        }
        st.uas.final_status = Some(code);
        st.relayed_branch = branch;
        self.advance(tx, TransactionState::Completed);
        self.cancel_branches_locked(tx, st, branch);
        if tx.is_local() {
            self.put_on_wait_locked(tx, st);
        } else {
            self.start_completion_locked(tx, st);
        }
    }

    /// Cancel every open branch except `except`. INVITE branches that saw a
    /// provisional get a CANCEL now; the others get one when their first
    /// provisional arrives.
    pub(super) fn cancel_branches_locked(&self, tx: &Arc<Transaction>, st: &mut ReplyState, except: Option<usize>) {
        for branch in st.branches.iter_mut() {
            if Some(branch.index) == except || !branch.is_open() || branch.canceled {
                continue;
            }
            branch.canceled = true;
            self.inner.timers.cancel(&mut branch.retr_slot);
            if !tx.is_invite() {
                continue;
            }
            if branch.got_provisional() {
                self.send_cancel_locked(tx, branch);
            } else {
                branch.cancel_pending = true;
            }
        }
    }

    /// Send a CANCEL for `branch`, retransmitted over unreliable transports.
    pub(super) fn send_cancel_locked(&self, tx: &Arc<Transaction>, branch: &mut crate::transaction::Branch) {
        if branch.cancel.is_some() {
            return;
        }
        let Some(destination) = branch.destination else {
            return;
        };
        let buffer = build::cancel_request(&branch.request).to_bytes();
        if let Err(e) = self.inner.transport.send(&destination, &buffer) {
            warn!(label = tx.label(), branch = branch.index, error = %e, "CANCEL not sent");
        }
        debug!(label = tx.label(), branch = branch.index, "CANCEL sent");
        let mut cancel = CancelState {
            buffer,
            slot: Default::default(),
            backoff: Default::default(),
            started_at: self.now(),
            replied: false,
        };
        if !destination.protocol.is_reliable() {
            let (list, delay) = cancel.backoff.next(self.settings());
            self.inner.timers.schedule(
                &mut cancel.slot,
                list,
                delay,
                TimerPayload::CancelRetransmit {
                    tx: tx.clone(),
                    branch: branch.index,
                },
            );
        }
        branch.cancel_pending = false;
        branch.cancel = Some(cancel);
    }
}
