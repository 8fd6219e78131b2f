//! Incoming side: request and response entry points, local replies and the
//! completion of server transactions.

use std::sync::Arc;

use rvoip_sip_message::{Method, Request, Response, StatusCode};
use tracing::{debug, trace, warn};

use super::{ReplyGuard, TimerPayload, TransactionManager};
use crate::callbacks::{CallbackAction, EventKind, Notice};
use crate::error::{Error, Result};
use crate::timer::ListId;
use crate::transaction::{flags, BranchId, ReplyState, Transaction, TransactionKey, TransactionState};
use crate::transport::Destination;

/// What [`TransactionManager::on_request`] did with a request.
#[derive(Debug)]
pub enum RequestOutcome {
    /// A transaction was created and `RequestIn` fired
    New(Arc<Transaction>),
    /// The request matched an existing transaction; its last response was
    /// resent
    Retransmission(Arc<Transaction>),
    /// Hop-by-hop ACK of a negative final response, or the ACK of a 2xx
    /// this engine generated without a dialog consumer; absorbed
    AckAbsorbed,
    /// End-to-end ACK handed to the dialog consumer
    AckDelivered,
    /// End-to-end ACK, to be forwarded by the caller. Carries the INVITE
    /// transaction whose 2xx it acknowledges, when it is still known.
    E2eAck(Option<Arc<Transaction>>),
    /// CANCEL answered with 200; `first` is false when the target was
    /// canceled before
    CancelHandled { target: Arc<Transaction>, first: bool },
    /// CANCEL without a matching transaction, to be forwarded statelessly
    CancelUnmatched,
}

/// What [`TransactionManager::on_response`] did with a response.
#[derive(Debug)]
pub enum ResponseOutcome {
    Matched { transaction: Arc<Transaction>, branch: usize },
    /// Reply to a CANCEL the engine sent on `branch`
    CancelReply { transaction: Arc<Transaction>, branch: usize },
    /// Arrived from inside a send on `transaction` while its reply state
    /// was in use; handled as soon as that work returns
    Deferred { transaction: Arc<Transaction>, branch: usize },
    /// Not for any transaction of this engine
    Unmatched,
}

fn check_request(request: &Request) -> Result<()> {
    if request.via.is_empty() {
        return Err(Error::protocol("request without Via"));
    }
    if request.call_id.trim().is_empty() {
        return Err(Error::protocol("empty Call-ID"));
    }
    if request.cseq.method != request.method {
        return Err(Error::protocol(format!(
            "CSeq method {} does not match {}",
            request.cseq.method, request.method
        )));
    }
    Ok(())
}

impl TransactionManager {
    /// Entry point for every request received from `source`.
    pub fn on_request(&self, request: Request, source: Destination) -> Result<RequestOutcome> {
        check_request(&request)?;
        let outcome = match request.method {
            Method::Ack => self.on_ack(&request),
            Method::Cancel => self.on_cancel(&request, source),
            _ => self.on_transaction_request(request, source)?,
        };
        match &outcome {
            RequestOutcome::New(tx) | RequestOutcome::Retransmission(tx) => self.settle_deferred(tx),
            RequestOutcome::CancelHandled { target, .. } => self.settle_deferred(target),
            _ => {}
        }
        Ok(outcome)
    }

    fn on_ack(&self, ack: &Request) -> RequestOutcome {
        let key = TransactionKey::from_request(ack);
        if let Some(tx) = self.inner.table.find(&key) {
            let guard = tx.reply.lock();
            let absorbed = {
                let mut st = guard.borrow_mut();
                match st.uas.final_status {
                    Some(code) if !code.is_success() => {
                        if !tx.has_flag(flags::WAITING) {
                            self.put_on_wait_locked(&tx, &mut st);
                        }
                        true
                    }
                    _ => false,
                }
            };
            self.flush_notices(&tx, &guard);
            if absorbed {
                trace!(label = tx.label(), "ACK absorbed");
                return RequestOutcome::AckAbsorbed;
            }
        }

        let invite = self.inner.table.find_e2e_ack_target(ack);
        if let (Some(invite), Some(consumer)) = (&invite, &self.inner.dialog_consumer) {
            let _guard = invite.reply.lock();
            consumer.on_e2e_ack(invite, ack);
            return RequestOutcome::AckDelivered;
        }
        if let Some(invite) = &invite {
            let answered_here = {
                let guard = invite.reply.lock();
                let st = guard.borrow();
                st.uas.local_ok_tag.is_some() && st.uas.local_ok_tag.as_deref() == ack.to_tag()
            };
            if answered_here {
                trace!(label = invite.label(), "ACK for a local 2xx absorbed");
                return RequestOutcome::AckAbsorbed;
            }
        }
        RequestOutcome::E2eAck(invite)
    }

    fn on_cancel(&self, cancel: &Request, source: Destination) -> RequestOutcome {
        let Some(target) = self.inner.table.find_cancel_target(cancel) else {
            debug!(call_id = %cancel.call_id, "CANCEL matches no transaction");
            return RequestOutcome::CancelUnmatched;
        };

        let tag = match target.sent_to_tag() {
            Some(tag) => tag,
            None => {
                let guard = target.reply.lock();
                let mut st = guard.borrow_mut();
                st.uas.to_tag.get_or_insert_with(|| self.generate_to_tag()).clone()
            }
        };
        let ok = Response::from_request(cancel, StatusCode::OK, None).with_to_tag(tag);
        if let Err(e) = self.inner.transport.send(&source, &ok.to_bytes()) {
            warn!(label = target.label(), error = %e, "200 for CANCEL not sent");
        }

        let first = self.cancel(&target);
        if first && target.is_invite() {
            let unforked = {
                let guard = target.reply.lock();
                let st = guard.borrow();
                st.branches.is_empty() && st.uas.final_status.is_none()
            };
            if unforked {
                if let Err(e) = self.reply(&target, StatusCode::REQUEST_TERMINATED, None) {
                    debug!(label = target.label(), error = %e, "487 not sent");
                }
            }
        }
        RequestOutcome::CancelHandled { target, first }
    }

    fn on_transaction_request(&self, request: Request, source: Destination) -> Result<RequestOutcome> {
        let now = self.now();
        let lifetime = self.settings().max_lifetime(request.method.is_invite());
        let (tx, created) = self.inner.table.lookup_or_create(&request, |bucket, label| {
            Transaction::new(bucket, label, request.clone(), Some(source), now, lifetime)
        });

        if !created {
            self.absorb_retransmission(&tx);
            return Ok(RequestOutcome::Retransmission(tx));
        }

        self.inner.stats.transaction_created(false);
        {
            let guard = tx.reply.lock();
            self.arm_lifetime_locked(&tx, &mut guard.borrow_mut().wait_slot);
            let action = self.fire_event(&tx, EventKind::RequestIn, None, Some(&request), None);
            if let CallbackAction::Reply { code, reason } = action {
                if let Err(e) = self.reply_guarded(&tx, &guard, code, reason.as_deref()) {
                    warn!(label = tx.label(), error = %e, "listener reply not sent");
                }
            }
        }
        Ok(RequestOutcome::New(tx))
    }

    /// Resend the last response of `tx`. A retransmission reaching a
    /// transaction in its wait phase restarts the wait.
    fn absorb_retransmission(&self, tx: &Arc<Transaction>) {
        let guard = tx.reply.lock();
        let mut st = guard.borrow_mut();
        let (Some(buffer), Some(source)) = (st.uas.buffer.clone(), tx.source()) else {
            trace!(label = tx.label(), "retransmission before any response");
            return;
        };
        if let Err(e) = self.inner.transport.send(&source, &buffer) {
            warn!(label = tx.label(), error = %e, "response retransmission failed");
        }
        self.inner.stats.response_retransmitted();
        if tx.state() == TransactionState::Completed && tx.has_flag(flags::WAITING) {
            let wait = self.clamp_to_deadline(tx, self.settings().wait_timeout);
            self.inner
                .timers
                .schedule(&mut st.wait_slot, ListId::Wait, wait, TimerPayload::Wait { tx: tx.clone() });
        }
        trace!(label = tx.label(), "retransmission absorbed");
    }

    /// Entry point for every response received from `source`. The top Via
    /// branch must decode as one the engine generated.
    pub fn on_response(&self, response: Response, source: Destination) -> Result<ResponseOutcome> {
        let via = response
            .top_via()
            .ok_or_else(|| Error::protocol("response without Via"))?;
        let id = via
            .branch()
            .and_then(BranchId::decode)
            .ok_or_else(|| Error::protocol("response branch is not one of ours"))?;
        let Some(tx) = self.inner.table.find_by_branch(&id) else {
            trace!(%source, branch = %id, "response for unknown transaction");
            return Ok(ResponseOutcome::Unmatched);
        };
        let request = tx.request();
        if request.call_id != response.call_id || request.cseq.seq != response.cseq.seq {
            debug!(label = tx.label(), "response Call-ID or CSeq mismatch");
            return Ok(ResponseOutcome::Unmatched);
        }

        let guard = tx.reply.lock();
        if guard.try_borrow_mut().is_err() {
            trace!(label = tx.label(), branch = id.branch, status = response.status.as_u16(), "response deferred");
            tx.defer_response(id.branch, response, source);
            drop(guard);
            return Ok(ResponseOutcome::Deferred {
                transaction: tx,
                branch: id.branch,
            });
        }
        let outcome = self.deliver_response(&tx, &guard, id.branch, response, source);
        self.flush_notices(&tx, &guard);
        drop(guard);
        Ok(outcome)
    }

    /// Hand a matched response to its branch. Called with the reply lock
    /// held and no borrow outstanding.
    pub(super) fn deliver_response(
        &self,
        tx: &Arc<Transaction>,
        guard: &ReplyGuard<'_>,
        branch: usize,
        response: Response,
        source: Destination,
    ) -> ResponseOutcome {
        if branch >= guard.borrow().branches.len() {
            return ResponseOutcome::Unmatched;
        }

        if response.cseq.method == Method::Cancel && *tx.method() != Method::Cancel {
            {
                let mut st = guard.borrow_mut();
                if let Some(cancel) = st.branches[branch].cancel.as_mut() {
                    cancel.replied = true;
                    self.inner.timers.cancel(&mut cancel.slot);
                }
            }
            trace!(label = tx.label(), branch, status = response.status.as_u16(), "CANCEL reply");
            return ResponseOutcome::CancelReply {
                transaction: tx.clone(),
                branch,
            };
        }
        if response.cseq.method != *tx.method() {
            return ResponseOutcome::Unmatched;
        }

        trace!(label = tx.label(), branch, status = response.status.as_u16(), %source, "response matched");
        self.fire_event(tx, EventKind::ResponseIn, Some(branch), None, Some(&response));
        self.handle_branch_reply(tx, guard, branch, response, false);
        ResponseOutcome::Matched {
            transaction: tx.clone(),
            branch,
        }
    }

    /// Handle the responses `tx` queued while its reply state was borrowed.
    pub(super) fn settle_deferred(&self, tx: &Arc<Transaction>) {
        if tx.has_deferred() {
            let guard = tx.reply.lock();
            self.flush_notices(tx, &guard);
        }
    }

    /// Send a locally generated response upstream on `tx`.
    ///
    /// At most one final response is ever sent; a second one fails with
    /// [`Error::AlreadyReplied`]. Replies above 100 get a To tag when the
    /// request had none, the same one for every reply of the transaction.
    pub fn reply(&self, tx: &Arc<Transaction>, code: StatusCode, reason: Option<&str>) -> Result<()> {
        let guard = tx.reply.lock();
        self.reply_guarded(tx, &guard, code, reason)
    }

    pub(super) fn reply_guarded(
        &self,
        tx: &Arc<Transaction>,
        guard: &ReplyGuard<'_>,
        code: StatusCode,
        reason: Option<&str>,
    ) -> Result<()> {
        let result = {
            let mut st = guard.borrow_mut();
            self.reply_locked(tx, &mut st, code, reason)
        };
        self.flush_notices(tx, guard);
        result
    }

    pub(super) fn reply_locked(
        &self,
        tx: &Arc<Transaction>,
        st: &mut ReplyState,
        code: StatusCode,
        reason: Option<&str>,
    ) -> Result<()> {
        let Some(source) = tx.source() else {
            return Err(Error::protocol("a locally originated transaction cannot be replied to"));
        };
        if let Some(sent) = st.uas.final_status {
            return Err(Error::AlreadyReplied(sent));
        }

        let mut response = Response::from_request(tx.request(), code, reason);
        if code.as_u16() > 100 && response.to_tag().is_none() {
            let tag = st.uas.to_tag.get_or_insert_with(|| self.generate_to_tag()).clone();
            response = response.with_to_tag(tag);
        }
        let buffer = response.to_bytes();
        if let Err(e) = self.inner.transport.send(&source, &buffer) {
            warn!(label = tx.label(), status = code.as_u16(), error = %e, "reply not sent");
        }
        debug!(label = tx.label(), status = code.as_u16(), "local reply");
        self.inner.stats.local_reply();
        tx.record_upstream(&response);
        st.uas.last_status = Some(code);
        if code.is_success() {
            st.uas.local_ok_tag = response.to_tag().map(str::to_string);
        }
        st.uas.response = Some(response.clone());
        st.uas.buffer = Some(buffer);
        st.notices.push(Notice::event(EventKind::ResponseOut, None, Some(response)));

        if code.is_provisional() {
            self.advance(tx, TransactionState::Proceeding);
            return Ok(());
        }
        st.uas.final_status = Some(code);
        self.advance(tx, TransactionState::Completed);
        self.cancel_branches_locked(tx, st, None);
        self.start_completion_locked(tx, st);
        Ok(())
    }

    /// A negative final answer to an INVITE waits for its ACK, retransmitted
    /// over unreliable transports; anything else goes straight to the wait
    /// phase.
    pub(super) fn start_completion_locked(&self, tx: &Arc<Transaction>, st: &mut ReplyState) {
        let negative_invite = tx.is_invite() && st.uas.final_status.is_some_and(|c| !c.is_success());
        if !negative_invite {
            self.put_on_wait_locked(tx, st);
            return;
        }
        if tx.source().is_some_and(|s| !s.protocol.is_reliable()) {
            let (list, delay) = st.uas.backoff.next(self.settings());
            self.inner
                .timers
                .schedule(&mut st.uas.retr_slot, list, delay, TimerPayload::UasRetransmit { tx: tx.clone() });
        }
        let fr = self.clamp_to_deadline(tx, self.settings().fr_timeout);
        self.inner.timers.schedule(
            &mut st.uas.fr_slot,
            ListId::FinalResponse,
            fr,
            TimerPayload::UasFinalResponse { tx: tx.clone() },
        );
    }

    /// Stop retransmitting and keep `tx` around for `wait_timeout` to absorb
    /// late retransmissions. The wait entry replaces the lifetime entry.
    pub(super) fn put_on_wait_locked(&self, tx: &Arc<Transaction>, st: &mut ReplyState) {
        self.inner.timers.cancel(&mut st.uas.retr_slot);
        self.inner.timers.cancel(&mut st.uas.fr_slot);
        for branch in st.branches.iter_mut() {
            self.inner.timers.cancel(&mut branch.retr_slot);
            self.inner.timers.cancel(&mut branch.fr_slot);
        }
        let wait = self.clamp_to_deadline(tx, self.settings().wait_timeout);
        self.inner
            .timers
            .schedule(&mut st.wait_slot, ListId::Wait, wait, TimerPayload::Wait { tx: tx.clone() });
        if !tx.set_flag(flags::WAITING) {
            self.inner.stats.wait_started();
            trace!(label = tx.label(), ?wait, "transaction waiting");
        }
    }

    pub(super) fn cancel_all_timers_locked(&self, st: &mut ReplyState) {
        self.inner.timers.cancel(&mut st.uas.retr_slot);
        self.inner.timers.cancel(&mut st.uas.fr_slot);
        self.inner.timers.cancel(&mut st.wait_slot);
        for branch in st.branches.iter_mut() {
            self.inner.timers.cancel(&mut branch.retr_slot);
            self.inner.timers.cancel(&mut branch.fr_slot);
            if let Some(cancel) = branch.cancel.as_mut() {
                self.inner.timers.cancel(&mut cancel.slot);
            }
        }
    }
}
