//! Destination health and DNS failover
//!
//! A destination that answered 503, never answered, or could not be sent
//! to is flagged for a while and skipped by later dispatches. A branch
//! whose host resolved to several addresses moves on to the next one after
//! a silent timeout or a 503 carrying Retry-After.

mod common;

use std::time::Duration;

use common::*;
use rvoip_sip_message::{Header, Method};
use rvoip_transaction_core::{to_json, AdminQuery, BlacklistConfig, BranchOutcome, HealthFlags};

const BOB1: &str = "198.51.100.1:5060";
const BOB2: &str = "198.51.100.2:5060";

fn with_pool(h: &Harness) {
    h.resolver
        .add_host("pool.example.net", vec![BOB1.parse().unwrap(), BOB2.parse().unwrap()]);
}

#[tokio::test]
async fn test_503_with_retry_after_fails_over() {
    let h = Harness::new(config());
    with_pool(&h);
    let tx = h.receive_new(invite("failover-503"));
    h.manager.dispatch(&tx, &[target("sip:bob@pool.example.net")]).unwrap();
    assert_eq!(h.transport.count_method(BOB1, "INVITE"), 1);

    let busy = reply_to(&tx.branch_request(0).unwrap(), 503, Some("p1")).with_header(Header::new("Retry-After", "30"));
    h.feed(busy);
    assert_eq!(h.transport.count_method(BOB1, "ACK"), 1);
    assert_eq!(h.transport.count_method(BOB2, "INVITE"), 1);
    assert!(h.transport.sent_to(CALLER).is_empty());
    assert_eq!(tx.branch_count(), 2);
    assert_eq!(h.manager.stats().dns_failovers, 1);

    // the quarantine follows Retry-After
    let flags = h.manager.blacklist().check(&dest(BOB1));
    assert!(flags.contains(HealthFlags::ERR_503));
    let entry = h.manager.blacklist_entries().into_iter().find(|e| e.ip.to_string() == "198.51.100.1").unwrap();
    assert_eq!(entry.expires_in, 30);

    h.answer(&tx, 1, 200, Some("p2"));
    assert_eq!(h.transport.upstream(200), 1);
    assert_eq!(tx.relayed_branch(), Some(1));
}

#[tokio::test]
async fn test_503_without_retry_after_does_not_fail_over() {
    let h = Harness::new(config());
    with_pool(&h);
    let tx = h.receive_new(invite("no-failover"));
    h.manager.dispatch(&tx, &[target("sip:bob@pool.example.net")]).unwrap();
    h.answer(&tx, 0, 503, Some("p1"));

    assert_eq!(h.transport.count_method(BOB2, "INVITE"), 0);
    assert_eq!(h.transport.upstream(500), 1);
    // default quarantine
    let entry = h.manager.blacklist_entries().pop().unwrap();
    assert_eq!(entry.expires_in, 60);
}

#[tokio::test]
async fn test_silent_destination_fails_over() {
    let h = Harness::new(config());
    with_pool(&h);
    let tx = h.receive_new(request(Method::Message, "failover-timeout", 1));
    h.manager.dispatch(&tx, &[target("sip:bob@pool.example.net")]).unwrap();

    h.advance(Duration::from_secs(5));
    assert!(h.manager.blacklist().check(&dest(BOB1)).contains(HealthFlags::TIMEOUT));
    assert_eq!(h.transport.count_method(BOB2, "MESSAGE"), 1);
    assert_eq!(h.transport.upstream(408), 0);

    h.answer(&tx, 1, 200, Some("p2"));
    assert_eq!(h.transport.upstream(200), 1);
}

#[tokio::test]
async fn test_failover_disabled() {
    let h = Harness::new(config().with_dns_failover(false));
    with_pool(&h);
    let tx = h.receive_new(request(Method::Message, "no-dns-failover", 1));
    h.manager.dispatch(&tx, &[target("sip:bob@pool.example.net")]).unwrap();
    h.advance(Duration::from_secs(5));
    assert_eq!(h.transport.count_method(BOB2, "MESSAGE"), 0);
    assert_eq!(h.transport.upstream(408), 1);
}

#[tokio::test]
async fn test_flagged_destination_is_skipped() {
    let h = Harness::new(config());
    with_pool(&h);
    h.manager.blacklist_add(&dest(BOB1), HealthFlags::TIMEOUT, None).unwrap();

    let tx = h.receive_new(invite("skip-flagged"));
    let outcomes = h.manager.dispatch(&tx, &[target("sip:bob@pool.example.net")]).unwrap();
    assert_eq!(outcomes, vec![BranchOutcome::Sent { branch: 0, destination: dest(BOB2) }]);
    assert_eq!(h.transport.count_method(BOB1, "INVITE"), 0);
    assert_eq!(h.manager.stats().blacklist_hits, 1);
}

#[tokio::test]
async fn test_every_destination_flagged() {
    let h = Harness::new(config());
    with_pool(&h);
    h.manager.blacklist_add(&dest(BOB1), HealthFlags::TIMEOUT, None).unwrap();
    h.manager.blacklist_add(&dest(BOB2), HealthFlags::ERR_503, None).unwrap();

    let tx = h.receive_new(invite("all-flagged"));
    let outcomes = h.manager.dispatch(&tx, &[target("sip:bob@pool.example.net")]).unwrap();
    assert!(matches!(outcomes[0], BranchOutcome::Failed { branch: 0, .. }));
    assert_eq!(h.transport.count_method(BOB1, "INVITE") + h.transport.count_method(BOB2, "INVITE"), 0);
    assert_eq!(h.transport.upstream(500), 1);
}

#[tokio::test]
async fn test_flagged_destinations_tried_last_when_allowed() {
    let blacklist = BlacklistConfig {
        try_flagged: true,
        ..BlacklistConfig::default()
    };
    let h = Harness::new(config().with_blacklist(blacklist));
    with_pool(&h);
    h.manager.blacklist_add(&dest(BOB1), HealthFlags::TIMEOUT, None).unwrap();
    h.manager.blacklist_add(&dest(BOB2), HealthFlags::TIMEOUT, None).unwrap();

    let tx = h.receive_new(request(Method::Options, "try-flagged", 1));
    h.manager.dispatch(&tx, &[target("sip:bob@pool.example.net")]).unwrap();
    assert_eq!(h.transport.count_method(BOB1, "OPTIONS"), 1);
    assert_eq!(h.manager.stats().blacklist_hits, 2);
}

#[tokio::test]
async fn test_quarantine_expires() {
    let h = Harness::new(config());
    h.manager.blacklist_add(&dest(BOB1), HealthFlags::SEND_ERROR, Some(Duration::from_secs(2))).unwrap();
    // flags accumulate, the expiry only grows
    h.manager.blacklist_add(&dest(BOB1), HealthFlags::TIMEOUT, Some(Duration::from_secs(1))).unwrap();
    assert_eq!(h.manager.blacklist().check(&dest(BOB1)), HealthFlags::SEND_ERROR | HealthFlags::TIMEOUT);

    h.advance(Duration::from_millis(1500));
    assert!(h.manager.blacklist().is_flagged(&dest(BOB1)));
    h.advance(Duration::from_millis(500));
    assert!(!h.manager.blacklist().is_flagged(&dest(BOB1)));
    assert!(h.manager.blacklist_entries().is_empty());
}

#[tokio::test]
async fn test_send_failure_flags_destination() {
    let h = Harness::new(config());
    with_pool(&h);
    h.transport.fail_to(BOB1);
    let tx = h.receive_new(invite("send-error"));
    let outcomes = h.manager.dispatch(&tx, &[target("sip:bob@pool.example.net")]).unwrap();
    assert_eq!(outcomes, vec![BranchOutcome::Sent { branch: 0, destination: dest(BOB2) }]);
    assert!(h.manager.blacklist().check(&dest(BOB1)).contains(HealthFlags::SEND_ERROR));
}

#[tokio::test]
async fn test_admin_snapshots() {
    let h = Harness::new(config());
    let tx = h.receive_new(invite("admin"));
    h.manager.dispatch(&tx, &[target("sip:bob@198.51.100.1")]).unwrap();
    h.manager.blacklist_add(&dest(BOB2), HealthFlags::ERR_503 | HealthFlags::TIMEOUT, None).unwrap();

    let listed = h.manager.transactions();
    assert_eq!(listed.len(), 1);
    let json: serde_json::Value = serde_json::from_str(&to_json(&listed).unwrap()).unwrap();
    assert_eq!(json[0]["method"], "INVITE");
    assert_eq!(json[0]["call_id"], "admin");
    assert_eq!(json[0]["local"], false);
    assert_eq!(json[0]["branches"].as_array().unwrap().len(), 1);
    assert_eq!(json[0]["branches"][0]["cancel_sent"], false);

    let one = AdminQuery::transaction(&h.manager, tx.bucket(), tx.label()).unwrap();
    assert_eq!(one.label, tx.label());
    assert!(AdminQuery::transaction(&h.manager, tx.bucket(), tx.label().wrapping_add(1)).is_none());

    let entries: serde_json::Value = serde_json::from_str(&to_json(&h.manager.blacklist_entries()).unwrap()).unwrap();
    assert_eq!(entries[0]["flag_names"], "timeout|503");
    assert_eq!(entries[0]["port"], 5060);

    let mem = h.manager.blacklist_mem_info();
    assert_eq!(mem.entries, 1);
    assert!(mem.used > 0);
    assert!(h.manager.blacklist_remove(&dest(BOB2)));
    assert!(!h.manager.blacklist_remove(&dest(BOB2)));
    h.manager.blacklist_add(&dest(BOB2), HealthFlags::PERMANENT, None).unwrap();
    assert_eq!(h.manager.blacklist_flush(), 1);
    assert_eq!(h.manager.blacklist_mem_info().used, 0);

    let stats: serde_json::Value = serde_json::from_str(&to_json(&AdminQuery::stats(&h.manager)).unwrap()).unwrap();
    assert_eq!(stats["created_uas"], 1);
}
