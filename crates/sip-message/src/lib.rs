//! Parsed SIP message values for the rvoip transaction engine
//!
//! This crate is the interface between the SIP parser and the transaction /
//! dialog engine in `rvoip-transaction-core`: the parser produces [`Request`]
//! and [`Response`] values, and the engine serializes the ones it builds back
//! into wire buffers with [`Request::to_bytes`] / [`Response::to_bytes`].
//!
//! Only the header values the engine has to reason about are typed (Via,
//! From/To/Contact/Route/Record-Route, CSeq, Call-ID, Max-Forwards). All other
//! headers are carried verbatim.

pub mod builder;
pub mod error;
pub mod header;
pub mod message;
pub mod method;
pub mod status;
pub mod uri;

pub use builder::{SimpleRequestBuilder, DEFAULT_MAX_FORWARDS};
pub use error::{ParseError, Result};
pub use header::{CSeq, Header, NameAddr, Via, BRANCH_MAGIC_COOKIE};
pub use message::{Message, Request, Response};
pub use method::Method;
pub use status::StatusCode;
pub use uri::{Param, Scheme, Uri};

/// Commonly used types
pub mod prelude {
    pub use crate::{
        CSeq, Header, Message, Method, NameAddr, Param, Request, Response, Scheme,
        SimpleRequestBuilder, StatusCode, Uri, Via,
    };
}
