//! Locally originated requests and the dialog seam
//!
//! A request the application sends itself gets a client transaction with a
//! completion callback that fires exactly once with the final response,
//! real or synthetic. INVITE negative finals are ACKed by the engine
//! (`LocalAck`); a 2xx is the dialog's business: the dialog consumer gets
//! the response and the application sends the ACK through
//! `send_ack`, routed by the dialog's hooks (RFC 3261 §13.2.2.4).

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use parking_lot::Mutex;
use rvoip_sip_message::{Method, NameAddr, Response, StatusCode};
use rvoip_transaction_core::{
    CallbackAction, Dialog, DialogState, Error, EventKind, LocalRequest, RequestOutcome, Transaction,
    TransactionState,
};

const BOB: &str = "198.51.100.1:5060";

type Completion = Box<dyn FnOnce(&Arc<Transaction>, &Response) + Send + 'static>;

/// A completion callback and the status codes it was called with
fn completions() -> (Arc<Mutex<Vec<u16>>>, Completion) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let callback: Completion = Box::new(move |_tx, response| sink.lock().push(response.status.as_u16()));
    (seen, callback)
}

fn count_events(h: &Harness, kind: EventKind) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    h.manager.on(kind, move |_event| {
        counter.fetch_add(1, Ordering::SeqCst);
        CallbackAction::Continue
    });
    count
}

#[tokio::test]
async fn test_local_request_completes_once() {
    let h = Harness::new(config());
    let (seen, callback) = completions();
    let tx = h
        .manager
        .send_request(LocalRequest::new(local_request(Method::Message, "local-ok", "sip:bob@198.51.100.1")).on_complete(callback))
        .unwrap();
    assert!(tx.is_local());
    assert_eq!(h.manager.stats().created_local, 1);

    let sent = h.transport.sent_to(BOB);
    assert_eq!(sent.len(), 1);
    // one Via, ours; the Contact placeholder is filled in
    assert_eq!(sent[0].data.lines().filter(|l| l.starts_with("Via: ")).count(), 1);
    assert!(header(&sent[0].data, "Contact").unwrap().contains("proxy@203.0.113.10:5060"));
    // a local request keeps its own Max-Forwards
    assert_eq!(header(&sent[0].data, "Max-Forwards"), Some("70"));

    h.answer(&tx, 0, 180, Some("bob"));
    h.answer(&tx, 0, 200, Some("bob"));
    h.answer(&tx, 0, 200, Some("bob"));
    assert_eq!(*seen.lock(), vec![200]);
    assert_eq!(tx.state(), TransactionState::Completed);
    // nothing is ever sent "upstream" for a local transaction
    assert!(h.transport.sent_to(CALLER).is_empty());

    h.advance(Duration::from_secs(5));
    assert_eq!(h.manager.transaction_count(), 0);
}

#[tokio::test]
async fn test_local_invite_failure_is_acked() {
    let h = Harness::new(config());
    let acks = count_events(&h, EventKind::LocalAck);
    let (seen, callback) = completions();
    let tx = h
        .manager
        .send_request(LocalRequest::new(local_request(Method::Invite, "local-busy", "sip:bob@198.51.100.1")).on_complete(callback))
        .unwrap();

    h.answer(&tx, 0, 486, Some("bob"));
    assert_eq!(*seen.lock(), vec![486]);
    assert_eq!(h.transport.count_method(BOB, "ACK"), 1);
    assert_eq!(acks.load(Ordering::SeqCst), 1);
    let ack = h.transport.sent_to(BOB).pop().unwrap();
    assert_eq!(header(&ack.data, "CSeq"), Some("1 ACK"));
    assert!(header(&ack.data, "To").unwrap().contains("tag=bob"));
}

#[tokio::test]
async fn test_local_request_timeout_reports_408() {
    let h = Harness::new(config());
    let (seen, callback) = completions();
    h.manager
        .send_request(LocalRequest::new(local_request(Method::Options, "local-timeout", "sip:bob@198.51.100.1")).on_complete(callback))
        .unwrap();

    h.advance(Duration::from_millis(4900));
    assert!(seen.lock().is_empty());
    h.advance(Duration::from_millis(100));
    assert_eq!(*seen.lock(), vec![408]);
    h.advance(Duration::from_secs(10));
    assert_eq!(*seen.lock(), vec![408]);
}

#[tokio::test]
async fn test_local_request_to_explicit_targets() {
    let h = Harness::new(config());
    let request = local_request(Method::Message, "local-targets", "sip:bob@example.com");
    let tx = h
        .manager
        .send_request(LocalRequest::new(request).with_targets(vec![target("sip:bob@198.51.100.7")]))
        .unwrap();
    assert_eq!(h.transport.count_method("198.51.100.7:5060", "MESSAGE"), 1);
    assert_eq!(tx.branch_request(0).unwrap().uri.host, "198.51.100.7");
}

#[tokio::test]
async fn test_unresolvable_local_request_is_discarded() {
    let h = Harness::new(config());
    let (seen, callback) = completions();
    let result = h.manager.send_request(
        LocalRequest::new(local_request(Method::Message, "local-nowhere", "sip:bob@nowhere.example.net")).on_complete(callback),
    );
    assert!(matches!(result, Err(Error::Resolution(_))));
    assert_eq!(h.manager.transaction_count(), 0);
    assert_eq!(h.manager.pending_timers(), 0);
    assert!(seen.lock().is_empty());
}

#[tokio::test]
async fn test_dialog_consumer_gets_tagged_responses() {
    let consumer = Arc::new(RecordingConsumer::default());
    let h = Harness::with_consumer(config(), consumer.clone());
    let tx = h
        .manager
        .send_request(LocalRequest::new(local_request(Method::Invite, "dlg-resp", "sip:bob@198.51.100.1")))
        .unwrap();

    h.answer(&tx, 0, 100, None);
    h.answer(&tx, 0, 180, None);
    h.answer(&tx, 0, 180, Some("bob"));
    h.answer(&tx, 0, 200, Some("bob"));
    assert_eq!(*consumer.responses.lock(), vec![180, 200]);

    // a 2xx retransmission goes to the dialog, never ACKed here
    h.answer(&tx, 0, 200, Some("bob"));
    assert_eq!(*consumer.responses.lock(), vec![180, 200, 200]);
    assert_eq!(h.transport.count_method(BOB, "ACK"), 0);
}

#[tokio::test]
async fn test_e2e_ack_delivered_to_consumer() {
    let consumer = Arc::new(RecordingConsumer::default());
    let h = Harness::with_consumer(config(), consumer.clone());
    let req = invite("e2e-consumer");
    let tx = h.receive_new(req.clone());
    h.manager.dispatch(&tx, &[target("sip:bob@198.51.100.1")]).unwrap();
    h.answer(&tx, 0, 200, Some("callee"));

    let ok = tx.last_response().unwrap();
    assert!(matches!(h.receive(e2e_ack(&req, &ok)), RequestOutcome::AckDelivered));
    assert_eq!(*consumer.acks.lock(), vec!["e2e-consumer".to_string()]);
    // the ACK of a proxied transaction was not a local response
    assert!(consumer.responses.lock().is_empty());
}

#[tokio::test]
async fn test_e2e_ack_without_consumer_is_returned() {
    let h = Harness::new(config());
    let req = invite("e2e-plain");
    let tx = h.receive_new(req.clone());
    h.manager.dispatch(&tx, &[target("sip:bob@198.51.100.1")]).unwrap();
    h.answer(&tx, 0, 200, Some("callee"));

    let ok = tx.last_response().unwrap();
    match h.receive(e2e_ack(&req, &ok)) {
        RequestOutcome::E2eAck(Some(invite)) => assert_eq!(invite.label(), tx.label()),
        other => panic!("unexpected outcome {:?}", other),
    }

    // an ACK with an unknown tag matches nothing
    let stray = e2e_ack(&req, &ok.clone().with_to_tag("someone-else"));
    assert!(matches!(h.receive(stray), RequestOutcome::E2eAck(None)));
}

#[tokio::test]
async fn test_ack_for_local_2xx_is_absorbed() {
    let h = Harness::new(config());
    let req = invite("e2e-local-ok");
    let tx = h.receive_new(req.clone());
    h.manager.reply(&tx, StatusCode::OK, None).unwrap();
    assert_eq!(h.transport.upstream(200), 1);

    let ok = tx.last_response().unwrap();
    assert!(ok.to_tag().is_some());
    let sent_before = h.transport.sent().len();
    assert!(matches!(h.receive(e2e_ack(&req, &ok)), RequestOutcome::AckAbsorbed));
    assert_eq!(h.transport.sent().len(), sent_before);

    // an ACK carrying another tag is still handed back
    let stray = e2e_ack(&req, &ok.clone().with_to_tag("someone-else"));
    assert!(matches!(h.receive(stray), RequestOutcome::E2eAck(None)));
}

#[tokio::test]
async fn test_dialog_round_trip_and_ack() {
    let h = Harness::new(config());
    let acks = count_events(&h, EventKind::LocalAck);
    let mut dialog = Dialog::new(
        Some("dlg-ack".to_string()),
        Some("alice-tag".to_string()),
        Some(1),
        "sip:alice@203.0.113.10".parse().unwrap(),
        "sip:bob@198.51.100.7".parse().unwrap(),
    );
    let invite = dialog.build_request(Method::Invite).unwrap();
    assert_eq!(invite.cseq.seq, 2);

    let (seen, callback) = completions();
    let tx = h.manager.send_request(LocalRequest::new(invite).on_complete(callback)).unwrap();
    assert_eq!(h.transport.count_method("198.51.100.7:5060", "INVITE"), 1);

    let ok = reply_to(&tx.branch_request(0).unwrap(), 200, Some("bob-tag"))
        .with_contact(NameAddr::new("sip:bob@198.51.100.9".parse().unwrap()));
    h.feed(ok.clone());
    assert_eq!(*seen.lock(), vec![200]);

    dialog.apply_response(&ok).unwrap();
    assert_eq!(dialog.state(), DialogState::Confirmed);
    assert_eq!(dialog.remote_tag(), Some("bob-tag"));

    let sent_to = h.manager.send_ack(&tx, &mut dialog).unwrap();
    assert_eq!(sent_to, dest("198.51.100.9:5060"));
    let ack = h.transport.sent_to("198.51.100.9:5060").pop().unwrap();
    assert!(ack.is_method("ACK"));
    assert_eq!(header(&ack.data, "CSeq"), Some("2 ACK"));
    assert!(header(&ack.data, "To").unwrap().contains("tag=bob-tag"));
    assert_eq!(acks.load(Ordering::SeqCst), 1);
    // the ACK is not a transaction
    assert_eq!(h.manager.transaction_count(), 1);
    assert_eq!(tx.final_status(), Some(StatusCode::OK));
}
