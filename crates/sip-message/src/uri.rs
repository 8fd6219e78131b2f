//! # SIP URIs
//!
//! A deliberately small URI value: scheme, optional user part, host, optional
//! port, the `;name[=value]` parameter list and the raw `?headers` part. The
//! transaction engine only needs to look at the host/port/transport (to find a
//! destination) and at the `lr` parameter (to tell loose from strict routers),
//! so nothing beyond that is interpreted.
//!
//! ```rust
//! use rvoip_sip_message::Uri;
//!
//! let uri: Uri = "sip:proxy.example.com:5070;transport=tcp;lr".parse().unwrap();
//! assert_eq!(uri.host, "proxy.example.com");
//! assert_eq!(uri.port, Some(5070));
//! assert!(uri.is_loose_route());
//! assert_eq!(uri.transport_param(), Some("tcp"));
//! assert_eq!(uri.to_string(), "sip:proxy.example.com:5070;transport=tcp;lr");
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ParseError, Result};

/// URI scheme
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scheme {
    Sip,
    Sips,
    Tel,
    Other(String),
}

impl Scheme {
    pub fn as_str(&self) -> &str {
        match self {
            Scheme::Sip => "sip",
            Scheme::Sips => "sips",
            Scheme::Tel => "tel",
            Scheme::Other(s) => s.as_str(),
        }
    }
}

/// A `name` or `name=value` parameter, shared by URIs and header values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub value: Option<String>,
}

impl Param {
    pub fn new(name: impl Into<String>, value: Option<String>) -> Self {
        Self { name: name.into(), value }
    }

    pub fn flag(name: impl Into<String>) -> Self {
        Self::new(name, None)
    }

    pub fn value(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, Some(value.into()))
    }

    pub(crate) fn parse_list(s: &str) -> Vec<Param> {
        s.split(';')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| match p.split_once('=') {
                Some((name, value)) => Param::value(name.trim(), value.trim()),
                None => Param::flag(p),
            })
            .collect()
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, ";{}={}", self.name, value),
            None => write!(f, ";{}", self.name),
        }
    }
}

/// Look up a parameter by case-insensitive name.
pub(crate) fn find_param<'a>(params: &'a [Param], name: &str) -> Option<&'a Param> {
    params.iter().find(|p| p.name.eq_ignore_ascii_case(name))
}

/// A SIP/SIPS/TEL URI
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Uri {
    pub scheme: Scheme,
    /// userinfo, password included when present
    pub user: Option<String>,
    /// host without IPv6 brackets
    pub host: String,
    pub port: Option<u16>,
    pub params: Vec<Param>,
    /// everything after `?`, verbatim
    pub headers: Option<String>,
}

impl Uri {
    /// `sip:host`
    pub fn sip(host: impl Into<String>) -> Self {
        Self {
            scheme: Scheme::Sip,
            user: None,
            host: host.into(),
            port: None,
            params: Vec::new(),
            headers: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    /// Whether the `lr` parameter is present (RFC 3261 §19.1.1).
    pub fn is_loose_route(&self) -> bool {
        find_param(&self.params, "lr").is_some()
    }

    /// Value of the `transport` parameter, if any
    pub fn transport_param(&self) -> Option<&str> {
        find_param(&self.params, "transport").and_then(|p| p.value.as_deref())
    }

    /// Value of a named parameter (`Some(None)` for a flag parameter)
    pub fn param(&self, name: &str) -> Option<Option<&str>> {
        find_param(&self.params, name).map(|p| p.value.as_deref())
    }

    pub fn is_secure(&self) -> bool {
        self.scheme == Scheme::Sips
    }

    /// `host[:port]`, brackets restored for IPv6 literals
    pub fn host_port(&self) -> String {
        let host = bracket_host(&self.host);
        match self.port {
            Some(port) => format!("{}:{}", host, port),
            None => host,
        }
    }
}

pub(crate) fn bracket_host(host: &str) -> String {
    if host.contains(':') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

/// Split `host[:port]`, accepting `[v6]:port`.
pub(crate) fn split_host_port(s: &str) -> std::result::Result<(String, Option<u16>), ()> {
    let s = s.trim();
    if let Some(rest) = s.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or(())?;
        let port = match after.strip_prefix(':') {
            Some(p) => Some(p.parse::<u16>().map_err(|_| ())?),
            None if after.is_empty() => None,
            None => return Err(()),
        };
        return Ok((host.to_string(), port));
    }
    match s.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port.parse::<u16>().map_err(|_| ())?;
            Ok((host.to_string(), Some(port)))
        }
        Some(_) => Err(()),
        None => Ok((s.to_string(), None)),
    }
}

impl FromStr for Uri {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ParseError::InvalidUri(s.to_string());
        let mut text = s.trim();
        if let Some(inner) = text.strip_prefix('<').and_then(|t| t.strip_suffix('>')) {
            text = inner;
        }

        let (scheme, rest) = text.split_once(':').ok_or_else(invalid)?;
        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "sip" => Scheme::Sip,
            "sips" => Scheme::Sips,
            "tel" => Scheme::Tel,
            "" => return Err(invalid()),
            other => Scheme::Other(other.to_string()),
        };

        let (rest, headers) = match rest.split_once('?') {
            Some((body, headers)) => (body, Some(headers.to_string())),
            None => (rest, None),
        };
        let (address, params) = match rest.split_once(';') {
            Some((address, params)) => (address, Param::parse_list(params)),
            None => (rest, Vec::new()),
        };

        if scheme == Scheme::Tel {
            if address.is_empty() {
                return Err(invalid());
            }
            return Ok(Uri {
                scheme,
                user: None,
                host: address.to_string(),
                port: None,
                params,
                headers,
            });
        }

        let (user, host_port) = match address.rsplit_once('@') {
            Some((user, host_port)) => (Some(user.to_string()), host_port),
            None => (None, address),
        };
        let (host, port) = split_host_port(host_port).map_err(|_| invalid())?;
        if host.is_empty() {
            return Err(invalid());
        }

        Ok(Uri {
            scheme,
            user,
            host,
            port,
            params,
            headers,
        })
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme.as_str())?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        if self.scheme == Scheme::Tel {
            f.write_str(&self.host)?;
        } else {
            f.write_str(&self.host_port())?;
        }
        for param in &self.params {
            write!(f, "{}", param)?;
        }
        if let Some(headers) = &self.headers {
            write!(f, "?{}", headers)?;
        }
        Ok(())
    }
}
