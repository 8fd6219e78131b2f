//! # SIP Status Codes
//!
//! Status codes are kept as a validated `u16` newtype instead of a closed enum:
//! the transaction engine must relay codes it has never heard of (`499`,
//! `699`, ...) and reason about them purely by class.
//!
//! ```rust
//! use rvoip_sip_message::StatusCode;
//!
//! let busy = StatusCode::BUSY_HERE;
//! assert_eq!(busy.as_u16(), 486);
//! assert_eq!(busy.class(), 4);
//! assert!(busy.is_final());
//! assert_eq!(busy.reason_phrase(), "Busy Here");
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ParseError, Result};

/// A SIP response status code in the range 100..=699
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct StatusCode(u16);

impl StatusCode {
    pub const TRYING: StatusCode = StatusCode(100);
    pub const RINGING: StatusCode = StatusCode(180);
    pub const SESSION_PROGRESS: StatusCode = StatusCode(183);
    pub const OK: StatusCode = StatusCode(200);
    pub const ACCEPTED: StatusCode = StatusCode(202);
    pub const MOVED_TEMPORARILY: StatusCode = StatusCode(302);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const REQUEST_TIMEOUT: StatusCode = StatusCode(408);
    pub const TEMPORARILY_UNAVAILABLE: StatusCode = StatusCode(480);
    pub const CALL_DOES_NOT_EXIST: StatusCode = StatusCode(481);
    pub const TOO_MANY_HOPS: StatusCode = StatusCode(483);
    pub const BUSY_HERE: StatusCode = StatusCode(486);
    pub const REQUEST_TERMINATED: StatusCode = StatusCode(487);
    pub const SERVER_INTERNAL_ERROR: StatusCode = StatusCode(500);
    pub const SERVICE_UNAVAILABLE: StatusCode = StatusCode(503);
    pub const BUSY_EVERYWHERE: StatusCode = StatusCode(600);
    pub const DECLINE: StatusCode = StatusCode(603);

    /// Validate and wrap a numeric code.
    pub fn from_u16(code: u16) -> Result<Self> {
        if (100..=699).contains(&code) {
            Ok(StatusCode(code))
        } else {
            Err(ParseError::InvalidStatus(code))
        }
    }

    pub fn as_u16(&self) -> u16 {
        self.0
    }

    /// Hundreds digit, 1..=6
    pub fn class(&self) -> u16 {
        self.0 / 100
    }

    pub fn is_provisional(&self) -> bool {
        self.class() == 1
    }

    pub fn is_success(&self) -> bool {
        self.class() == 2
    }

    /// 2xx-6xx
    pub fn is_final(&self) -> bool {
        self.0 >= 200
    }

    /// 3xx-6xx
    pub fn is_failure(&self) -> bool {
        self.0 >= 300
    }

    /// Default reason phrase (RFC 3261 §21); "Unknown" for unregistered codes.
    pub fn reason_phrase(&self) -> &'static str {
        match self.0 {
            100 => "Trying",
            180 => "Ringing",
            181 => "Call Is Being Forwarded",
            182 => "Queued",
            183 => "Session Progress",
            200 => "OK",
            202 => "Accepted",
            300 => "Multiple Choices",
            301 => "Moved Permanently",
            302 => "Moved Temporarily",
            305 => "Use Proxy",
            380 => "Alternative Service",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            407 => "Proxy Authentication Required",
            408 => "Request Timeout",
            480 => "Temporarily Unavailable",
            481 => "Call/Transaction Does Not Exist",
            482 => "Loop Detected",
            483 => "Too Many Hops",
            486 => "Busy Here",
            487 => "Request Terminated",
            488 => "Not Acceptable Here",
            500 => "Server Internal Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Server Time-out",
            600 => "Busy Everywhere",
            603 => "Decline",
            604 => "Does Not Exist Anywhere",
            606 => "Not Acceptable",
            _ => "Unknown",
        }
    }
}

impl TryFrom<u16> for StatusCode {
    type Error = ParseError;

    fn try_from(value: u16) -> Result<Self> {
        StatusCode::from_u16(value)
    }
}

impl From<StatusCode> for u16 {
    fn from(code: StatusCode) -> u16 {
        code.0
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_range() {
        assert!(StatusCode::from_u16(99).is_err());
        assert!(StatusCode::from_u16(700).is_err());
        assert_eq!(StatusCode::from_u16(699).unwrap().class(), 6);
    }

    #[test]
    fn test_status_serde_rejects_out_of_range() {
        let ok: StatusCode = serde_json::from_str("487").unwrap();
        assert_eq!(ok, StatusCode::REQUEST_TERMINATED);
        assert!(serde_json::from_str::<StatusCode>("42").is_err());
    }
}
