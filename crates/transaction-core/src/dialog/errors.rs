use rvoip_sip_message::ParseError;
use thiserror::Error;

use super::DialogState;

/// Result type for dialog operations
pub type DialogResult<T> = Result<T, DialogError>;

/// Errors raised while building or updating a dialog
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DialogError {
    /// The message cannot establish or update a dialog
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The message belongs to a different dialog
    #[error("Message does not belong to dialog {expected}: {found}")]
    Mismatch { expected: String, found: String },

    /// The operation is not valid in the dialog's current state
    #[error("Operation {operation} not allowed in state {state}")]
    InvalidState { operation: String, state: DialogState },

    /// A value in the message could not be parsed
    #[error("SIP message error: {0}")]
    Message(#[from] ParseError),
}

impl DialogError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        DialogError::Protocol(msg.into())
    }
}
