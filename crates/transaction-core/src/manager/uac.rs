//! Outgoing side: forking, cancellation, stateless forwarding and locally
//! originated requests.

use std::net::SocketAddr;
use std::sync::Arc;

use rvoip_sip_message::{Method, Request, Response, StatusCode, BRANCH_MAGIC_COOKIE};
use tracing::{debug, info, warn};

use super::relay::Work;
use super::{TimerPayload, TransactionManager};
use crate::blacklist::HealthFlags;
use crate::callbacks::{CompletionCallback, EventKind};
use crate::dialog::Dialog;
use crate::dispatch::{build, group_by_q, BranchOutcome, Target};
use crate::error::{Error, Result};
use crate::timer::ListId;
use crate::transaction::{flags, Branch, ReplyState, Transaction};
use crate::transport::{Destination, Protocol, TransportError};

/// A request originated by the application rather than relayed.
pub struct LocalRequest {
    pub request: Request,
    /// Where to send it. Empty means the Request-URI (through the first
    /// Route entry, if any).
    pub targets: Vec<Target>,
    /// Receives the final response, real or synthetic, exactly once.
    pub on_complete: Option<CompletionCallback>,
}

impl LocalRequest {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            targets: Vec::new(),
            on_complete: None,
        }
    }

    pub fn with_targets(mut self, targets: Vec<Target>) -> Self {
        self.targets = targets;
        self
    }

    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&Arc<Transaction>, &Response) + Send + 'static,
    {
        self.on_complete = Some(Box::new(callback));
        self
    }
}

impl std::fmt::Debug for LocalRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRequest")
            .field("method", &self.request.method)
            .field("call_id", &self.request.call_id)
            .field("targets", &self.targets.len())
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

impl TransactionManager {
    /// Fork `tx` to every target in parallel, one branch each.
    ///
    /// Targets are resolved before anything is sent, so a resolution error
    /// leaves the transaction untouched. A target whose addresses all failed
    /// gets a branch holding a synthetic 503; when no branch could be sent
    /// at all, the failure is relayed before this returns.
    pub fn dispatch(&self, tx: &Arc<Transaction>, targets: &[Target]) -> Result<Vec<BranchOutcome>> {
        if targets.is_empty() {
            return match tx.method() {
                Method::Ack | Method::Cancel => Ok(Vec::new()),
                method => Err(Error::NoBranches(method.to_string())),
            };
        }
        let guard = tx.reply.lock();
        let outcomes = {
            let mut st = guard.borrow_mut();
            self.add_branches_locked(tx, &mut st, targets)
        };
        self.flush_notices(tx, &guard);
        let outcomes = outcomes?;

        if !outcomes.iter().any(BranchOutcome::is_sent) {
            if let Some(last) = outcomes.last() {
                self.process_replies(tx, &guard, Work::Evaluate(last.branch()));
            }
        }
        Ok(outcomes)
    }

    /// Serial forking: targets are grouped by descending q-value, the first
    /// group is dispatched now and each later group only once every branch
    /// of the previous one failed.
    pub fn dispatch_serial(&self, tx: &Arc<Transaction>, targets: &[Target]) -> Result<Vec<BranchOutcome>> {
        let mut groups = group_by_q(targets).into_iter();
        let Some(first) = groups.next() else {
            return self.dispatch(tx, targets);
        };
        {
            let guard = tx.reply.lock();
            guard.borrow_mut().serial = groups.collect();
        }
        let result = self.dispatch(tx, &first);
        if result.is_err() {
            tx.reply.lock().borrow_mut().serial.clear();
        }
        result
    }

    /// Cancel every pending branch of `tx`. Returns false when the
    /// transaction was already canceled, in which case nothing is sent.
    pub fn cancel(&self, tx: &Arc<Transaction>) -> bool {
        if tx.set_flag(flags::CANCELED) {
            return false;
        }
        let guard = tx.reply.lock();
        {
            let mut st = guard.borrow_mut();
            st.serial.clear();
            self.cancel_branches_locked(tx, &mut st, None);
        }
        self.flush_notices(tx, &guard);
        debug!(label = tx.label(), "transaction canceled");
        true
    }

    pub(super) fn add_branches_locked(
        &self,
        tx: &Arc<Transaction>,
        st: &mut ReplyState,
        targets: &[Target],
    ) -> Result<Vec<BranchOutcome>> {
        if tx.is_canceled() || st.uas.final_status.is_some() {
            return Err(Error::BranchesClosed);
        }
        let max = self.inner.config.max_branches;
        if st.branches.len() + targets.len() > max {
            return Err(Error::TooManyBranches(max));
        }
        let hops = build::next_max_forwards(tx.request(), tx.is_local())?;

        let mut resolved = Vec::with_capacity(targets.len());
        for target in targets {
            let destinations = self.inner.resolver.resolve(target.route_uri())?;
            if destinations.is_empty() {
                return Err(Error::Resolution(target.route_uri().to_string()));
            }
            resolved.push((target.clone(), destinations));
        }

        Ok(resolved
            .into_iter()
            .map(|(target, destinations)| self.start_branch_locked(tx, st, target, destinations, hops))
            .collect())
    }

    /// Healthy destinations first, flagged ones after them when allowed.
    fn order_destinations(&self, destinations: Vec<Destination>) -> Vec<Destination> {
        let (healthy, flagged): (Vec<_>, Vec<_>) = destinations
            .into_iter()
            .partition(|d| self.inner.blacklist.check(d).is_empty());
        for destination in &flagged {
            debug!(%destination, "skipping blacklisted destination");
            self.inner.stats.blacklist_hit();
        }
        let mut ordered = healthy;
        if self.inner.blacklist.config().try_flagged {
            ordered.extend(flagged);
        }
        ordered
    }

    /// Open a new branch for `target`, trying `destinations` in order.
    pub(super) fn start_branch_locked(
        &self,
        tx: &Arc<Transaction>,
        st: &mut ReplyState,
        target: Target,
        destinations: Vec<Destination>,
        hops: u32,
    ) -> BranchOutcome {
        let index = st.branches.len();
        let branch_id = tx.branch_id(index).encode();
        let ordered = self.order_destinations(destinations);
        let mut reason = String::from("every destination is blacklisted");

        for (position, destination) in ordered.iter().enumerate() {
            let Some(local) = self.inner.transport.local_address(destination.protocol) else {
                reason = TransportError::NoSocket(destination.protocol).to_string();
                continue;
            };
            let via = build::local_via(destination.protocol, local, &branch_id);
            let request = build::branch_request(tx.request(), &target, via, hops, local);
            let buffer = request.to_bytes();

            if let Err(e) = self.inner.transport.send(destination, &buffer) {
                warn!(label = tx.label(), branch = index, %destination, error = %e, "branch send failed");
                if self.inner.blacklist.config().on_send_error {
                    if let Err(e) = self.inner.blacklist.add(HealthFlags::SEND_ERROR, destination, None) {
                        debug!(error = %e, "send error not recorded");
                    }
                }
                reason = e.to_string();
                continue;
            }

            let mut branch = Branch::new(index, target, request, buffer);
            branch.destination = Some(*destination);
            branch.failover = ordered[position + 1..].to_vec();
            if !destination.protocol.is_reliable() {
                let (list, delay) = branch.backoff.next(self.settings());
                self.inner.timers.schedule(
                    &mut branch.retr_slot,
                    list,
                    delay,
                    TimerPayload::Retransmit { tx: tx.clone(), branch: index },
                );
            }
            let fr = self.clamp_to_deadline(tx, self.settings().fr_timeout);
            self.inner.timers.schedule(
                &mut branch.fr_slot,
                ListId::FinalResponse,
                fr,
                TimerPayload::FinalResponse { tx: tx.clone(), branch: index },
            );
            debug!(label = tx.label(), branch = index, %destination, uri = %branch.target.uri, "branch sent");
            st.branches.push(branch);
            return BranchOutcome::Sent {
                branch: index,
                destination: *destination,
            };
        }

        // nothing went out: the branch completes at once with a local 503
        let local = SocketAddr::from(([0, 0, 0, 0], 0));
        let via = build::local_via(Protocol::Udp, local, &branch_id);
        let request = build::branch_request(tx.request(), &target, via, hops, local);
        let buffer = request.to_bytes();
        let unavailable = Response::from_request(&request, StatusCode::SERVICE_UNAVAILABLE, None);
        let mut branch = Branch::new(index, target, request, buffer);
        branch.last_code = Some(StatusCode::SERVICE_UNAVAILABLE);
        branch.final_code = Some(StatusCode::SERVICE_UNAVAILABLE);
        branch.reply = Some(unavailable);
        warn!(label = tx.label(), branch = index, %reason, "branch could not be sent");
        st.branches.push(branch);
        BranchOutcome::Failed { branch: index, reason }
    }

    /// Forward `request` once, without creating a transaction.
    pub fn forward_stateless(&self, request: &Request, target: &Target) -> Result<Destination> {
        self.send_stateless(request, target, false)
    }

    fn send_stateless(&self, request: &Request, target: &Target, local: bool) -> Result<Destination> {
        let hops = build::next_max_forwards(request, local)?;
        let destinations = self.inner.resolver.resolve(target.route_uri())?;
        let ordered = self.order_destinations(destinations);
        if ordered.is_empty() {
            return Err(Error::Resolution(target.route_uri().to_string()));
        }
        let branch = format!("{}{:016x}", BRANCH_MAGIC_COOKIE, rand::random::<u64>());

        let mut last_error = None;
        for destination in ordered {
            let Some(local_addr) = self.inner.transport.local_address(destination.protocol) else {
                last_error = Some(TransportError::NoSocket(destination.protocol));
                continue;
            };
            let via = build::local_via(destination.protocol, local_addr, &branch);
            let out = build::branch_request(request, target, via, hops, local_addr);
            match self.inner.transport.send(&destination, &out.to_bytes()) {
                Ok(()) => {
                    debug!(method = %request.method, %destination, "forwarded statelessly");
                    return Ok(destination);
                }
                Err(e) => {
                    warn!(method = %request.method, %destination, error = %e, "stateless send failed");
                    last_error = Some(e);
                }
            }
        }
        Err(match last_error {
            Some(e) => Error::Transport(e),
            None => Error::Resolution(target.route_uri().to_string()),
        })
    }

    /// Start a transaction for a locally originated request.
    ///
    /// ACK and CANCEL are refused: use [`send_ack`](Self::send_ack) and
    /// [`cancel`](Self::cancel). When dispatch fails the transaction is
    /// discarded without invoking the completion callback.
    pub fn send_request(&self, local: LocalRequest) -> Result<Arc<Transaction>> {
        let LocalRequest {
            request,
            targets,
            on_complete,
        } = local;
        if matches!(request.method, Method::Ack | Method::Cancel) {
            return Err(Error::protocol(format!("{} cannot start a transaction", request.method)));
        }

        let now = self.now();
        let lifetime = self.settings().max_lifetime(request.method.is_invite());
        let tx = self.inner.table.insert_local(&request, |bucket, label| {
            Transaction::new(bucket, label, request.clone(), None, now, lifetime)
        });
        self.inner.stats.transaction_created(true);
        {
            let guard = tx.reply.lock();
            let mut st = guard.borrow_mut();
            st.on_complete = on_complete;
            self.arm_lifetime_locked(&tx, &mut st.wait_slot);
        }

        let targets = if targets.is_empty() {
            vec![Target::from_request(&request)]
        } else {
            targets
        };
        if let Err(e) = self.dispatch(&tx, &targets) {
            warn!(label = tx.label(), method = %request.method, error = %e, "local request not sent");
            self.discard_local(&tx);
            return Err(e);
        }
        info!(label = tx.label(), method = %request.method, call_id = %request.call_id, "local request sent");
        Ok(tx)
    }

    fn discard_local(&self, tx: &Arc<Transaction>) {
        {
            let guard = tx.reply.lock();
            let mut st = guard.borrow_mut();
            self.cancel_all_timers_locked(&mut st);
            st.on_complete = None;
        }
        tx.state_cell().terminate();
        if self.inner.table.remove(tx) {
            self.inner.stats.destroyed(false);
        }
        tx.set_flag(flags::DESTROYED);
    }

    /// Send the ACK for a 2xx received on the local INVITE `tx`, addressed
    /// through `dialog`'s routing hooks. The ACK is not a transaction.
    pub fn send_ack(&self, tx: &Arc<Transaction>, dialog: &mut Dialog) -> Result<Destination> {
        let ack = dialog.build_request(Method::Ack)?;
        let target = Target::new(ack.uri.clone()).with_next_hop(dialog.hooks().next_hop.clone());
        let destination = self.send_stateless(&ack, &target, true)?;
        let _guard = tx.reply.lock();
        self.fire_event(tx, EventKind::LocalAck, None, Some(&ack), None);
        Ok(destination)
    }
}
