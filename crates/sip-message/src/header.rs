//! Typed values of the headers the transaction engine inspects: `Via`,
//! name-addr headers (`From`, `To`, `Contact`, `Route`, `Record-Route`) and
//! `CSeq`. Every other header travels as an opaque [`Header`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ParseError, Result};
use crate::method::Method;
use crate::uri::{bracket_host, find_param, split_host_port, Param, Uri};

/// Magic cookie that marks an RFC 3261 branch identifier
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

/// An opaque header that is copied through without interpretation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// `[display-name] <uri> *(;param)` as used by From/To/Contact/Route
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NameAddr {
    pub display_name: Option<String>,
    pub uri: Uri,
    /// header parameters (outside the angle brackets)
    pub params: Vec<Param>,
}

impl NameAddr {
    pub fn new(uri: Uri) -> Self {
        Self {
            display_name: None,
            uri,
            params: Vec::new(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.set_tag(tag);
        self
    }

    pub fn tag(&self) -> Option<&str> {
        find_param(&self.params, "tag").and_then(|p| p.value.as_deref())
    }

    /// Set or replace the `tag` parameter.
    pub fn set_tag(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        match self.params.iter_mut().find(|p| p.name.eq_ignore_ascii_case("tag")) {
            Some(param) => param.value = Some(tag),
            None => self.params.push(Param::value("tag", tag)),
        }
    }
}

impl FromStr for NameAddr {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self> {
        let text = s.trim();
        let invalid = || ParseError::InvalidAddress(s.to_string());

        if let Some(open) = text.find('<') {
            let close = text[open..].find('>').map(|i| open + i).ok_or_else(invalid)?;
            let display = text[..open].trim().trim_matches('"').trim();
            let uri: Uri = text[open + 1..close].parse().map_err(|_| invalid())?;
            Ok(NameAddr {
                display_name: (!display.is_empty()).then(|| display.to_string()),
                uri,
                params: Param::parse_list(&text[close + 1..]),
            })
        } else {
            // addr-spec form: parameters belong to the header, not the URI
            let (uri, params) = match text.split_once(';') {
                Some((uri, params)) => (uri, Param::parse_list(params)),
                None => (text, Vec::new()),
            };
            Ok(NameAddr {
                display_name: None,
                uri: uri.parse().map_err(|_| invalid())?,
                params,
            })
        }
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.display_name {
            write!(f, "\"{}\" ", name)?;
        }
        write!(f, "<{}>", self.uri)?;
        for param in &self.params {
            write!(f, "{}", param)?;
        }
        Ok(())
    }
}

/// One Via header value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Via {
    /// transport token, upper-case (`UDP`, `TCP`, `TLS`, ...)
    pub transport: String,
    pub host: String,
    pub port: Option<u16>,
    pub params: Vec<Param>,
}

impl Via {
    pub fn new(transport: impl Into<String>, host: impl Into<String>, port: Option<u16>, branch: impl Into<String>) -> Self {
        Self {
            transport: transport.into().to_ascii_uppercase(),
            host: host.into(),
            port,
            params: vec![Param::value("branch", branch)],
        }
    }

    pub fn branch(&self) -> Option<&str> {
        find_param(&self.params, "branch").and_then(|p| p.value.as_deref())
    }

    /// Whether the branch carries the RFC 3261 magic cookie.
    pub fn has_rfc3261_branch(&self) -> bool {
        self.branch().is_some_and(|b| b.starts_with(BRANCH_MAGIC_COOKIE))
    }

    pub fn received(&self) -> Option<&str> {
        find_param(&self.params, "received").and_then(|p| p.value.as_deref())
    }

    /// `host[:port]` as written in the header
    pub fn sent_by(&self) -> String {
        let host = bracket_host(&self.host);
        match self.port {
            Some(port) => format!("{}:{}", host, port),
            None => host,
        }
    }
}

impl FromStr for Via {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ParseError::InvalidVia(s.to_string());
        let text = s.trim();
        let (head, params) = match text.split_once(';') {
            Some((head, params)) => (head, Param::parse_list(params)),
            None => (text, Vec::new()),
        };
        // "SIP/2.0/UDP host:port", tolerating spaces around the slashes
        let slash = head.rfind('/').ok_or_else(invalid)?;
        let protocol = head[..slash].replace(' ', "");
        if !protocol.eq_ignore_ascii_case("SIP/2.0") {
            return Err(invalid());
        }
        let rest = head[slash + 1..].trim_start();
        let (transport, sent_by) = rest.split_once(char::is_whitespace).ok_or_else(invalid)?;
        let (host, port) = split_host_port(sent_by).map_err(|_| invalid())?;
        if transport.is_empty() || host.is_empty() {
            return Err(invalid());
        }
        Ok(Via {
            transport: transport.to_ascii_uppercase(),
            host,
            port,
            params,
        })
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} {}", self.transport, self.sent_by())?;
        for param in &self.params {
            write!(f, "{}", param)?;
        }
        Ok(())
    }
}

/// CSeq header value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

impl CSeq {
    pub fn new(seq: u32, method: Method) -> Self {
        Self { seq, method }
    }
}

impl FromStr for CSeq {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ParseError::InvalidCSeq(s.to_string());
        let mut parts = s.split_whitespace();
        let seq = parts.next().ok_or_else(invalid)?.parse::<u32>().map_err(|_| invalid())?;
        let method = parts.next().ok_or_else(invalid)?.parse::<Method>().map_err(|_| invalid())?;
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(CSeq { seq, method })
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}
