use crate::dialog::DialogError;
use crate::transport::TransportError;
use rvoip_sip_message::{ParseError, StatusCode};
use thiserror::Error;

/// A type alias for handling `Result`s with `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in SIP transaction handling
#[derive(Error, Debug)]
pub enum Error {
    /// A message failed the boundary checks and was rejected before any
    /// transaction state was created.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Error originating from the message value crate.
    #[error("SIP message error: {0}")]
    Message(#[from] ParseError),

    /// Transaction not found for the given label.
    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    /// A final response was already sent on the UAS side.
    #[error("Transaction already replied with {0}")]
    AlreadyReplied(StatusCode),

    /// Invalid transaction state transition attempted.
    #[error("Invalid transaction state transition: {0}")]
    InvalidStateTransition(String),

    /// Dispatch was asked to send a request without any target.
    #[error("No destination to dispatch {0} to")]
    NoBranches(String),

    /// The per-transaction branch limit would be exceeded.
    #[error("Too many branches (limit {0})")]
    TooManyBranches(usize),

    /// Max-Forwards reached zero.
    #[error("Too many hops")]
    TooManyHops,

    /// The transaction is canceled or already final and takes no new branches.
    #[error("Transaction does not accept new branches")]
    BranchesClosed,

    /// Error originating from the transport collaborator.
    #[error("SIP transport error: {0}")]
    Transport(#[from] TransportError),

    /// Target could not be resolved to any destination.
    #[error("Could not resolve {0}")]
    Resolution(String),

    /// The destination health cache hit its memory ceiling.
    #[error("Destination blacklist full ({used} of {max} bytes)")]
    BlacklistFull { used: usize, max: usize },

    /// Dialog construction or update failure.
    #[error("Dialog error: {0}")]
    Dialog(#[from] DialogError),

    /// Administrative output could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Rejected configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// An internal invariant does not hold; always logged at error level.
    #[error("Invariant violated: {0}")]
    Invariant(String),
}

impl Error {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }
}
