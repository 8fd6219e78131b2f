//! # rvoip-transaction-core
//!
//! Stateful SIP transaction engine for proxies and user agents: stateful
//! forwarding with parallel and serial forking, local request origination,
//! retransmission and timeout timers, CANCEL handling, destination health
//! tracking and SIP dialog routing.
//!
//! ## Architecture
//!
//! ```text
//!   transport ──► on_request / on_response
//!                       │
//!                       ▼
//!              ┌──────────────────┐      listeners / subscribers
//!              │TransactionManager│ ───► EventRegistry
//!              └──────────────────┘
//!               │      │       │
//!               ▼      ▼       ▼
//!            table   timers   blacklist ◄── admin queries
//!               │
//!               ▼
//!         Transaction ── branches ── Transport::send
//! ```
//!
//! - [`manager`]: the engine and its entry points.
//! - [`transaction`]: the transaction record, matching keys, the relay
//!   decision and the state machine.
//! - [`dispatch`]: targets, resolution and request construction.
//! - [`timer`]: sorted-expiry timer lists, the clock and the tick driver.
//! - [`blacklist`]: the destination health cache.
//! - [`dialog`]: dialog state, route hooks and the dialog consumer seam.
//! - [`callbacks`]: named events, listeners and event streams.
//! - [`admin`]: administrative snapshots.
//!
//! ## Example
//!
//! ```no_run
//! use std::net::SocketAddr;
//! use std::sync::Arc;
//! use rvoip_transaction_core::prelude::*;
//!
//! struct Udp;
//!
//! impl Transport for Udp {
//!     fn send(&self, _dest: &Destination, _buf: &[u8]) -> std::result::Result<(), TransportError> {
//!         Ok(())
//!     }
//!
//!     fn local_address(&self, _protocol: Protocol) -> Option<SocketAddr> {
//!         "192.0.2.10:5060".parse().ok()
//!     }
//! }
//!
//! # async fn run() -> rvoip_transaction_core::Result<()> {
//! let manager = TransactionManager::new(Arc::new(Udp), TmConfig::default())?;
//! let driver = TimerDriver::spawn(manager.clone());
//! manager.on(EventKind::RequestIn, |_event| CallbackAction::Continue);
//! // feed manager.on_request(..) / manager.on_response(..) from the socket
//! driver.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod blacklist;
pub mod callbacks;
pub mod config;
pub mod dialog;
pub mod dispatch;
mod error;
pub mod logging;
pub mod manager;
pub mod stats;
pub mod table;
pub mod timer;
pub mod transaction;
pub mod transport;

pub use admin::{to_json, AdminQuery};
pub use blacklist::{DestinationHealthCache, HealthFlags};
pub use callbacks::{CallbackAction, EventKind, EventRecord, EventRegistry, TransactionEvent};
pub use config::{BlacklistConfig, MatchingMode, TmConfig};
pub use dialog::{Dialog, DialogConsumer, DialogError, DialogState};
pub use dispatch::{BranchOutcome, Resolver, StaticResolver, Target};
pub use error::{Error, Result};
pub use manager::{
    AppTimer, LocalRequest, RequestOutcome, ResponseOutcome, TransactionManager, TransactionManagerBuilder,
};
pub use stats::StatsSnapshot;
pub use timer::{Clock, ManualClock, SystemClock, TimerDriver, TimerSettings};
pub use transaction::{Transaction, TransactionKey, TransactionSnapshot, TransactionState};
pub use transport::{Destination, Protocol, Transport, TransportError};

/// Re-export of the message crate
pub use rvoip_sip_message as message;

/// The types an embedding application needs most.
pub mod prelude {
    pub use crate::admin::AdminQuery;
    pub use crate::callbacks::{CallbackAction, EventKind, TransactionEvent};
    pub use crate::config::TmConfig;
    pub use crate::dialog::{Dialog, DialogConsumer};
    pub use crate::dispatch::Target;
    pub use crate::error::{Error, Result};
    pub use crate::manager::{LocalRequest, RequestOutcome, ResponseOutcome, TransactionManager};
    pub use crate::timer::TimerDriver;
    pub use crate::transaction::{Transaction, TransactionState};
    pub use crate::transport::{Destination, Protocol, Transport, TransportError};
    pub use rvoip_sip_message::{Method, Request, Response, StatusCode};
}
