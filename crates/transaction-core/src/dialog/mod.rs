//! SIP dialog construction and routing
//!
//! This module derives and maintains the long-lived dialog identity (Call-ID,
//! tags, sequence numbers, route set) used to address in-dialog requests,
//! and computes the routing hooks for them.
//!
//! - [`Dialog`]: UAC (`new`) and UAS (`from_request`) construction, response
//!   and request driven transitions, request building.
//! - [`RouteHooks`] / [`compute_hooks`]: loose, strict and no-route rules.
//! - [`DialogConsumer`]: the capability through which the transaction engine
//!   hands end-to-end ACKs and dialog-relevant responses to a dialog layer.

mod dialog_impl;
mod errors;
pub mod hooks;

use std::sync::Arc;

use rvoip_sip_message::{Request, Response};

use crate::transaction::Transaction;

pub use dialog_impl::{Dialog, DialogId, DialogState, DialogTransition, Sequence};
pub use errors::{DialogError, DialogResult};
pub use hooks::{compute_hooks, RouteHooks};

/// Dialog layer capability, installed once on the transaction manager.
///
/// Both methods run on the engine's thread with the transaction's reply lock
/// held; implementations must not block.
pub trait DialogConsumer: Send + Sync {
    /// An ACK for a 2xx matched `invite`. It belongs to the dialog, not to
    /// the INVITE transaction.
    fn on_e2e_ack(&self, invite: &Arc<Transaction>, ack: &Request);

    /// A response on a locally originated transaction that may create or
    /// update a dialog (provisional with To tag or any final).
    fn on_dialog_response(&self, transaction: &Arc<Transaction>, response: &Response);
}
