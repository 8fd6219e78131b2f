use thiserror::Error;

/// Errors produced while reading an individual SIP value (URI, Via, CSeq, ...)
/// or while assembling a message from a builder.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The URI could not be split into scheme and body
    #[error("invalid URI: {0}")]
    InvalidUri(String),

    /// A name-addr / addr-spec value was malformed
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// A Via value was malformed
    #[error("invalid Via: {0}")]
    InvalidVia(String),

    /// A CSeq value was malformed
    #[error("invalid CSeq: {0}")]
    InvalidCSeq(String),

    /// An unknown or malformed method token
    #[error("invalid method: {0}")]
    InvalidMethod(String),

    /// A status code outside 100..=699
    #[error("invalid status code: {0}")]
    InvalidStatus(u16),

    /// A builder was finished without a mandatory header
    #[error("missing mandatory header: {0}")]
    MissingHeader(&'static str),
}

/// Result type for message value operations
pub type Result<T> = std::result::Result<T, ParseError>;
