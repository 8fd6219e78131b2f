//! Shared harness for the integration tests: a recording transport, a
//! manual clock driving the engine's ticks, and message builders.

#![allow(dead_code)]

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use rvoip_sip_message::{Method, Request, Response, SimpleRequestBuilder, StatusCode};
use rvoip_transaction_core::dialog::DialogConsumer;
use rvoip_transaction_core::timer::{Clock, ManualClock};
use rvoip_transaction_core::{
    Destination, Protocol, RequestOutcome, ResponseOutcome, StaticResolver, Target, TmConfig, Transaction, TransactionManager, Transport,
    TransportError,
};

/// Address the engine sends from
pub const LOCAL: &str = "203.0.113.10:5060";
/// Previous hop of proxied requests
pub const CALLER: &str = "192.0.2.1:5060";

/// One buffer handed to the transport
#[derive(Debug, Clone)]
pub struct Sent {
    pub destination: Destination,
    pub data: String,
    pub at: Instant,
}

impl Sent {
    pub fn first_line(&self) -> &str {
        self.data.lines().next().unwrap_or_default()
    }

    pub fn is_status(&self, code: u16) -> bool {
        self.first_line().starts_with(&format!("SIP/2.0 {}", code))
    }

    pub fn is_method(&self, method: &str) -> bool {
        self.first_line().starts_with(&format!("{} ", method))
    }
}

/// Transport recording every send. Sends to addresses registered with
/// [`fail_to`](MockTransport::fail_to) fail and are not recorded.
#[derive(Debug)]
pub struct MockTransport {
    sent: Mutex<Vec<Sent>>,
    failing: Mutex<HashSet<SocketAddr>>,
    local: SocketAddr,
    clock: ManualClock,
}

impl MockTransport {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            local: LOCAL.parse().unwrap(),
            clock,
        }
    }

    pub fn fail_to(&self, addr: &str) {
        self.failing.lock().insert(addr.parse().unwrap());
    }

    pub fn heal(&self, addr: &str) {
        self.failing.lock().remove(&addr.parse().unwrap());
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }

    /// Sends to `addr`, in order
    pub fn sent_to(&self, addr: &str) -> Vec<Sent> {
        let addr: SocketAddr = addr.parse().unwrap();
        self.sent().into_iter().filter(|s| s.destination.addr == addr).collect()
    }

    /// Responses with `code` sent to the caller
    pub fn upstream(&self, code: u16) -> usize {
        self.sent_to(CALLER).iter().filter(|s| s.is_status(code)).count()
    }

    pub fn count_method(&self, addr: &str, method: &str) -> usize {
        self.sent_to(addr).iter().filter(|s| s.is_method(method)).count()
    }
}

impl Transport for MockTransport {
    fn send(&self, destination: &Destination, buffer: &[u8]) -> Result<(), TransportError> {
        if self.failing.lock().contains(&destination.addr) {
            return Err(TransportError::SendFailed(*destination, "unreachable".into()));
        }
        self.sent.lock().push(Sent {
            destination: *destination,
            data: String::from_utf8_lossy(buffer).into_owned(),
            at: self.clock.now(),
        });
        Ok(())
    }

    fn local_address(&self, _protocol: Protocol) -> Option<SocketAddr> {
        Some(self.local)
    }
}

/// An engine over a [`MockTransport`] and a [`ManualClock`].
pub struct Harness {
    pub manager: TransactionManager,
    pub transport: Arc<MockTransport>,
    pub clock: ManualClock,
    pub resolver: Arc<StaticResolver>,
}

impl Harness {
    pub fn new(config: TmConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_consumer(config: TmConfig, consumer: Arc<dyn DialogConsumer>) -> Self {
        Self::build(config, Some(consumer))
    }

    fn build(config: TmConfig, consumer: Option<Arc<dyn DialogConsumer>>) -> Self {
        let clock = ManualClock::new();
        let transport = Arc::new(MockTransport::new(clock.clone()));
        let resolver = Arc::new(StaticResolver::new());
        let mut builder = TransactionManager::builder(transport.clone())
            .config(config)
            .resolver(resolver.clone())
            .clock(Arc::new(clock.clone()));
        if let Some(consumer) = consumer {
            builder = builder.dialog_consumer(consumer);
        }
        Self {
            manager: builder.build().unwrap(),
            transport,
            clock,
            resolver,
        }
    }

    /// Move the clock forward in 100 ms steps, ticking after each step.
    /// Returns the number of timers that fired.
    pub fn advance(&self, by: Duration) -> usize {
        let step = Duration::from_millis(100);
        let mut left = by;
        let mut fired = 0;
        while !left.is_zero() {
            let d = left.min(step);
            self.clock.advance(d);
            fired += self.manager.on_tick();
            left -= d;
        }
        fired
    }

    pub fn caller(&self) -> Destination {
        caller()
    }

    /// Feed `request` as if it came from the caller.
    pub fn receive(&self, request: Request) -> RequestOutcome {
        self.manager.on_request(request, caller()).unwrap()
    }

    /// Receive `request` and return the transaction it created.
    pub fn receive_new(&self, request: Request) -> Arc<Transaction> {
        match self.receive(request) {
            RequestOutcome::New(tx) => tx,
            other => panic!("expected a new transaction, got {:?}", other),
        }
    }

    /// Feed a reply to branch `index` of `tx`, built from the request as it
    /// was sent on that branch.
    pub fn answer(&self, tx: &Arc<Transaction>, index: usize, code: u16, tag: Option<&str>) -> Response {
        let sent = tx.branch_request(index).expect("branch exists");
        let response = reply_to(&sent, code, tag);
        self.feed(response.clone());
        response
    }

    /// Feed `response` as if it came from downstream.
    pub fn feed(&self, response: Response) -> ResponseOutcome {
        let from = Destination::udp("198.51.100.254:5060".parse().unwrap());
        self.manager.on_response(response, from).unwrap()
    }
}

pub fn caller() -> Destination {
    Destination::udp(CALLER.parse().unwrap())
}

pub fn dest(addr: &str) -> Destination {
    Destination::udp(addr.parse().unwrap())
}

/// Value of the first `name` header line in a serialized message
pub fn header<'a>(data: &'a str, name: &str) -> Option<&'a str> {
    let prefix = format!("{}: ", name);
    data.lines().find_map(|line| line.strip_prefix(prefix.as_str()))
}

/// Default test configuration: defaults with a short final-response timeout.
pub fn config() -> TmConfig {
    TmConfig::default().with_fr_timeout(Duration::from_secs(5))
}

pub fn status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap()
}

pub fn target(uri: &str) -> Target {
    Target::parse(uri).unwrap()
}

/// A request from the caller, as a proxy receives it
pub fn request(method: Method, call_id: &str, cseq: u32) -> Request {
    SimpleRequestBuilder::new(method, "sip:bob@example.com")
        .unwrap()
        .via(&format!("SIP/2.0/UDP {};branch=z9hG4bK-{}-{}", CALLER, call_id, cseq))
        .unwrap()
        .from("\"Alice\" <sip:alice@example.com>;tag=alice")
        .unwrap()
        .to("<sip:bob@example.com>")
        .unwrap()
        .contact("<sip:alice@192.0.2.1>")
        .unwrap()
        .call_id(call_id)
        .cseq(cseq)
        .build()
        .unwrap()
}

pub fn invite(call_id: &str) -> Request {
    request(Method::Invite, call_id, 1)
}

/// A request originated locally: no Via yet
pub fn local_request(method: Method, call_id: &str, uri: &str) -> Request {
    SimpleRequestBuilder::new(method, uri)
        .unwrap()
        .from("<sip:proxy@203.0.113.10>;tag=local")
        .unwrap()
        .to(&format!("<{}>", uri))
        .unwrap()
        .contact("<sip:proxy@0.0.0.0>")
        .unwrap()
        .call_id(call_id)
        .cseq(1)
        .build()
        .unwrap()
}

/// CANCEL for a request received from the caller (same Via branch)
pub fn cancel_for(original: &Request) -> Request {
    let mut cancel = original.clone();
    cancel.method = Method::Cancel;
    cancel.cseq.method = Method::Cancel;
    cancel.contact.clear();
    cancel
}

/// ACK the caller sends for a negative final response (same Via branch)
pub fn hop_ack(original: &Request, response: &Response) -> Request {
    let mut ack = original.clone();
    ack.method = Method::Ack;
    ack.cseq.method = Method::Ack;
    ack.to = response.to.clone();
    ack.contact.clear();
    ack
}

/// ACK the caller sends for a 2xx: a new transaction with its own branch
pub fn e2e_ack(original: &Request, response: &Response) -> Request {
    let mut ack = hop_ack(original, response);
    ack.via = vec![format!("SIP/2.0/UDP {};branch=z9hG4bK-ack-{}", CALLER, original.call_id)
        .parse()
        .unwrap()];
    ack
}

pub fn reply_to(request: &Request, code: u16, tag: Option<&str>) -> Response {
    let response = Response::from_request(request, status(code), None);
    match tag {
        Some(tag) => response.with_to_tag(tag),
        None => response,
    }
}

/// Dialog consumer recording what the engine hands it
#[derive(Debug, Default)]
pub struct RecordingConsumer {
    pub responses: Mutex<Vec<u16>>,
    pub acks: Mutex<Vec<String>>,
}

impl DialogConsumer for RecordingConsumer {
    fn on_e2e_ack(&self, _invite: &Arc<Transaction>, ack: &Request) {
        self.acks.lock().push(ack.call_id.clone());
    }

    fn on_dialog_response(&self, _transaction: &Arc<Transaction>, response: &Response) {
        self.responses.lock().push(response.status.as_u16());
    }
}
