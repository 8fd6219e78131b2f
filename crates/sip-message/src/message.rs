//! # SIP Requests and Responses
//!
//! The parsed-message value handed to the transaction engine by the parser
//! collaborator, and the value the engine serializes back into a wire buffer.
//! The headers the engine reasons about are typed fields; everything else is
//! kept in order in `headers` and copied through untouched.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::header::{CSeq, Header, NameAddr, Via};
use crate::method::Method;
use crate::status::StatusCode;
use crate::uri::Uri;

/// A SIP request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    /// top-most first
    pub via: Vec<Via>,
    pub from: NameAddr,
    pub to: NameAddr,
    pub call_id: String,
    pub cseq: CSeq,
    pub max_forwards: Option<u32>,
    pub contact: Vec<NameAddr>,
    pub route: Vec<NameAddr>,
    pub record_route: Vec<NameAddr>,
    /// opaque headers, in arrival order
    pub headers: Vec<Header>,
    pub body: Bytes,
}

/// A SIP response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: StatusCode,
    pub reason: String,
    pub via: Vec<Via>,
    pub from: NameAddr,
    pub to: NameAddr,
    pub call_id: String,
    pub cseq: CSeq,
    pub contact: Vec<NameAddr>,
    pub record_route: Vec<NameAddr>,
    pub headers: Vec<Header>,
    pub body: Bytes,
}

/// Either kind of message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Request(Request),
    Response(Response),
}

fn find_header<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers.iter().find(|h| h.is(name)).map(|h| h.value.as_str())
}

fn put_line(buf: &mut BytesMut, name: &str, value: impl std::fmt::Display) {
    buf.put_slice(format!("{}: {}\r\n", name, value).as_bytes());
}

fn put_common(
    buf: &mut BytesMut,
    from: &NameAddr,
    to: &NameAddr,
    call_id: &str,
    cseq: &CSeq,
    contact: &[NameAddr],
    headers: &[Header],
    body: &Bytes,
) {
    put_line(buf, "From", from);
    put_line(buf, "To", to);
    put_line(buf, "Call-ID", call_id);
    put_line(buf, "CSeq", cseq);
    for c in contact {
        put_line(buf, "Contact", c);
    }
    for h in headers.iter().filter(|h| !h.is("Content-Length")) {
        put_line(buf, &h.name, &h.value);
    }
    put_line(buf, "Content-Length", body.len());
    buf.put_slice(b"\r\n");
    buf.put_slice(body);
}

impl Request {
    /// The top-most Via, i.e. the previous hop.
    pub fn top_via(&self) -> Option<&Via> {
        self.via.first()
    }

    /// First opaque header with the given name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn from_tag(&self) -> Option<&str> {
        self.from.tag()
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.to.tag()
    }

    /// Serialize into a wire buffer. Content-Length is always recomputed.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(512 + self.body.len());
        buf.put_slice(format!("{} {} SIP/2.0\r\n", self.method, self.uri).as_bytes());
        for via in &self.via {
            put_line(&mut buf, "Via", via);
        }
        if let Some(max_forwards) = self.max_forwards {
            put_line(&mut buf, "Max-Forwards", max_forwards);
        }
        for route in &self.route {
            put_line(&mut buf, "Route", route);
        }
        for rr in &self.record_route {
            put_line(&mut buf, "Record-Route", rr);
        }
        put_common(
            &mut buf,
            &self.from,
            &self.to,
            &self.call_id,
            &self.cseq,
            &self.contact,
            &self.headers,
            &self.body,
        );
        buf.freeze()
    }
}

impl Response {
    /// Build a response to `request` (RFC 3261 §8.2.6.2): Via list, From, To,
    /// Call-ID and CSeq are copied, Record-Route is mirrored for 18x/2xx.
    pub fn from_request(request: &Request, status: StatusCode, reason: Option<&str>) -> Self {
        let record_route = if status.is_success() || (status.as_u16() > 100 && status.is_provisional()) {
            request.record_route.clone()
        } else {
            Vec::new()
        };
        Response {
            status,
            reason: reason.unwrap_or(status.reason_phrase()).to_string(),
            via: request.via.clone(),
            from: request.from.clone(),
            to: request.to.clone(),
            call_id: request.call_id.clone(),
            cseq: request.cseq.clone(),
            contact: Vec::new(),
            record_route,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn top_via(&self) -> Option<&Via> {
        self.via.first()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.to.tag()
    }

    /// Seconds from a `Retry-After` header, comments and parameters ignored.
    pub fn retry_after(&self) -> Option<u32> {
        let value = self.header("Retry-After")?;
        let digits: String = value.trim().chars().take_while(char::is_ascii_digit).collect();
        digits.parse().ok()
    }

    pub fn with_header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    pub fn with_contact(mut self, contact: NameAddr) -> Self {
        self.contact.push(contact);
        self
    }

    pub fn with_to_tag(mut self, tag: impl Into<String>) -> Self {
        self.to.set_tag(tag);
        self
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(512 + self.body.len());
        buf.put_slice(format!("SIP/2.0 {} {}\r\n", self.status, self.reason).as_bytes());
        for via in &self.via {
            put_line(&mut buf, "Via", via);
        }
        for rr in &self.record_route {
            put_line(&mut buf, "Record-Route", rr);
        }
        put_common(
            &mut buf,
            &self.from,
            &self.to,
            &self.call_id,
            &self.cseq,
            &self.contact,
            &self.headers,
            &self.body,
        );
        buf.freeze()
    }
}

impl Message {
    pub fn call_id(&self) -> &str {
        match self {
            Message::Request(r) => &r.call_id,
            Message::Response(r) => &r.call_id,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            Message::Request(r) => r.to_bytes(),
            Message::Response(r) => r.to_bytes(),
        }
    }
}

impl From<Request> for Message {
    fn from(r: Request) -> Self {
        Message::Request(r)
    }
}

impl From<Response> for Message {
    fn from(r: Response) -> Self {
        Message::Response(r)
    }
}
