//! Fluent construction of requests, mainly for locally originated requests and
//! for tests. String arguments go through the same `FromStr` impls used for
//! individual values, so a malformed value surfaces as a [`ParseError`].

use bytes::Bytes;

use crate::error::{ParseError, Result};
use crate::header::{CSeq, Header, NameAddr, Via};
use crate::message::Request;
use crate::method::Method;
use crate::uri::Uri;

/// Default Max-Forwards for new requests (RFC 3261 §8.1.1.6)
pub const DEFAULT_MAX_FORWARDS: u32 = 70;

/// Builder for [`Request`]
#[derive(Debug, Clone)]
pub struct SimpleRequestBuilder {
    method: Method,
    uri: Uri,
    via: Vec<Via>,
    from: Option<NameAddr>,
    to: Option<NameAddr>,
    call_id: Option<String>,
    cseq: Option<CSeq>,
    max_forwards: Option<u32>,
    contact: Vec<NameAddr>,
    route: Vec<NameAddr>,
    record_route: Vec<NameAddr>,
    headers: Vec<Header>,
    body: Bytes,
}

impl SimpleRequestBuilder {
    pub fn new(method: Method, uri: &str) -> Result<Self> {
        Ok(Self::with_uri(method, uri.parse()?))
    }

    pub fn with_uri(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            via: Vec::new(),
            from: None,
            to: None,
            call_id: None,
            cseq: None,
            max_forwards: Some(DEFAULT_MAX_FORWARDS),
            contact: Vec::new(),
            route: Vec::new(),
            record_route: Vec::new(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Append a Via (call in top-to-bottom order).
    pub fn via(mut self, via: &str) -> Result<Self> {
        self.via.push(via.parse()?);
        Ok(self)
    }

    pub fn via_value(mut self, via: Via) -> Self {
        self.via.push(via);
        self
    }

    pub fn from(mut self, from: &str) -> Result<Self> {
        self.from = Some(from.parse()?);
        Ok(self)
    }

    pub fn from_addr(mut self, from: NameAddr) -> Self {
        self.from = Some(from);
        self
    }

    pub fn to(mut self, to: &str) -> Result<Self> {
        self.to = Some(to.parse()?);
        Ok(self)
    }

    pub fn to_addr(mut self, to: NameAddr) -> Self {
        self.to = Some(to);
        self
    }

    pub fn call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = Some(call_id.into());
        self
    }

    /// CSeq with the request's own method.
    pub fn cseq(mut self, seq: u32) -> Self {
        self.cseq = Some(CSeq::new(seq, self.method.clone()));
        self
    }

    pub fn cseq_value(mut self, cseq: CSeq) -> Self {
        self.cseq = Some(cseq);
        self
    }

    pub fn max_forwards(mut self, hops: Option<u32>) -> Self {
        self.max_forwards = hops;
        self
    }

    pub fn contact(mut self, contact: &str) -> Result<Self> {
        self.contact.push(contact.parse()?);
        Ok(self)
    }

    pub fn route(mut self, route: &str) -> Result<Self> {
        self.route.push(route.parse()?);
        Ok(self)
    }

    pub fn route_value(mut self, route: NameAddr) -> Self {
        self.route.push(route);
        self
    }

    pub fn record_route(mut self, rr: &str) -> Result<Self> {
        self.record_route.push(rr.parse()?);
        Ok(self)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(Header::new(name, value));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Finish the request. From, To, Call-ID and CSeq are mandatory; Via is
    /// not, since the transaction layer prepends its own before sending.
    pub fn build(self) -> Result<Request> {
        Ok(Request {
            from: self.from.ok_or(ParseError::MissingHeader("From"))?,
            to: self.to.ok_or(ParseError::MissingHeader("To"))?,
            call_id: self.call_id.ok_or(ParseError::MissingHeader("Call-ID"))?,
            cseq: self.cseq.ok_or(ParseError::MissingHeader("CSeq"))?,
            method: self.method,
            uri: self.uri,
            via: self.via,
            max_forwards: self.max_forwards,
            contact: self.contact,
            route: self.route,
            record_route: self.record_route,
            headers: self.headers,
            body: self.body,
        })
    }
}
