//! The transaction table
//!
//! A fixed number of buckets, each behind its own lock, indexed by a uniform
//! hash over Call-ID and CSeq number. A transaction lives in exactly one
//! bucket from insertion until `remove`; the table's `Arc` is its share of
//! the reference count. Each bucket hands out increasing labels, so
//! `(bucket, label)` identifies a transaction and is what outgoing branch
//! ids encode.
//!
//! Lock order: a bucket lock may be followed by a transaction's upstream-tag
//! lock, never by a reply lock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rvoip_sip_message::Request;
use tokio::time::Instant;
use tracing::debug;

use crate::transaction::{flags, BranchId, MatchingOptions, Transaction, TransactionKey, TransactionSnapshot};

#[derive(Default)]
struct Bucket {
    entries: Vec<Arc<Transaction>>,
    next_label: u32,
}

impl Bucket {
    fn take_label(&mut self) -> u32 {
        let label = self.next_label;
        self.next_label = self.next_label.wrapping_add(1);
        label
    }
}

pub struct TransactionTable {
    buckets: Vec<Mutex<Bucket>>,
    options: MatchingOptions,
    len: AtomicUsize,
}

impl std::fmt::Debug for TransactionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionTable")
            .field("buckets", &self.buckets.len())
            .field("len", &self.len())
            .field("options", &self.options)
            .finish()
    }
}

impl TransactionTable {
    /// `buckets` is rounded up to a power of two.
    pub fn new(buckets: usize, options: MatchingOptions) -> Self {
        let count = buckets.max(1).next_power_of_two();
        Self {
            buckets: (0..count).map(|_| Mutex::new(Bucket::default())).collect(),
            options,
            len: AtomicUsize::new(0),
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn options(&self) -> &MatchingOptions {
        &self.options
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn matches(&self, key: &TransactionKey, tx: &Transaction) -> bool {
        if tx.is_local() {
            return false;
        }
        if self.options.uses_branch(key) {
            key.matches_branch(tx.key())
        } else {
            key.matches_legacy(tx.key(), &self.options, tx.sent_to_tag().as_deref())
        }
    }

    /// The transaction `key` belongs to, if any.
    pub fn find(&self, key: &TransactionKey) -> Option<Arc<Transaction>> {
        let bucket = self.buckets[key.bucket(self.buckets.len())].lock();
        bucket.entries.iter().find(|tx| self.matches(key, tx)).cloned()
    }

    /// Match `request` against the table, or insert the transaction built by
    /// `create(bucket, label)` when nothing matches. The second value tells
    /// whether the transaction was created. Lookup and insertion happen
    /// under one bucket lock, so two copies of a request racing each other
    /// end up in the same transaction.
    pub fn lookup_or_create<F>(&self, request: &Request, create: F) -> (Arc<Transaction>, bool)
    where
        F: FnOnce(usize, u32) -> Transaction,
    {
        let key = TransactionKey::from_request(request);
        let index = key.bucket(self.buckets.len());
        let mut bucket = self.buckets[index].lock();
        if let Some(existing) = bucket.entries.iter().find(|tx| self.matches(&key, tx)) {
            return (existing.clone(), false);
        }
        let label = bucket.take_label();
        let tx = Arc::new(create(index, label));
        bucket.entries.push(tx.clone());
        self.len.fetch_add(1, Ordering::AcqRel);
        debug!(bucket = index, label, call_id = %request.call_id, method = %request.method, "transaction created");
        (tx, true)
    }

    /// Insert a transaction for a locally originated request. It never
    /// matches inbound requests.
    pub fn insert_local<F>(&self, request: &Request, create: F) -> Arc<Transaction>
    where
        F: FnOnce(usize, u32) -> Transaction,
    {
        let index = TransactionKey::from_request(request).bucket(self.buckets.len());
        let mut bucket = self.buckets[index].lock();
        let label = bucket.take_label();
        let tx = Arc::new(create(index, label));
        bucket.entries.push(tx.clone());
        self.len.fetch_add(1, Ordering::AcqRel);
        debug!(bucket = index, label, call_id = %request.call_id, method = %request.method, "local transaction created");
        tx
    }

    /// The transaction that sent branch `id`.
    pub fn find_by_branch(&self, id: &BranchId) -> Option<Arc<Transaction>> {
        let bucket = self.buckets.get(id.bucket)?.lock();
        bucket.entries.iter().find(|tx| tx.label() == id.label).cloned()
    }

    pub fn find_by_label(&self, bucket: usize, label: u32) -> Option<Arc<Transaction>> {
        self.find_by_branch(&BranchId::new(bucket, label, 0))
    }

    /// The INVITE (or other) transaction a CANCEL refers to.
    pub fn find_cancel_target(&self, cancel: &Request) -> Option<Arc<Transaction>> {
        let key = TransactionKey::from_request(cancel);
        let bucket = self.buckets[key.bucket(self.buckets.len())].lock();
        bucket
            .entries
            .iter()
            .find(|tx| !tx.is_local() && key.matches_cancel(tx.key(), &self.options))
            .cloned()
    }

    /// The INVITE whose relayed 2xx this ACK acknowledges.
    pub fn find_e2e_ack_target(&self, ack: &Request) -> Option<Arc<Transaction>> {
        let key = TransactionKey::from_request(ack);
        let bucket = self.buckets[key.bucket(self.buckets.len())].lock();
        bucket
            .entries
            .iter()
            .find(|tx| key.matches_e2e_ack(tx.key(), &tx.ok_to_tags()))
            .cloned()
    }

    /// Unlink `tx`, releasing the table's reference. Idempotent: returns
    /// false when it was not linked.
    pub fn remove(&self, tx: &Arc<Transaction>) -> bool {
        let mut bucket = match self.buckets.get(tx.bucket()) {
            Some(bucket) => bucket.lock(),
            None => return false,
        };
        match bucket.entries.iter().position(|t| Arc::ptr_eq(t, tx)) {
            Some(pos) => {
                bucket.entries.remove(pos);
                tx.set_flag(flags::UNLINKED);
                self.len.fetch_sub(1, Ordering::AcqRel);
                debug!(bucket = tx.bucket(), label = tx.label(), "transaction unlinked");
                true
            }
            None => false,
        }
    }

    /// Every linked transaction ordered by `(bucket, label)`.
    pub fn transactions(&self) -> Vec<Arc<Transaction>> {
        let mut all: Vec<Arc<Transaction>> = Vec::with_capacity(self.len());
        for bucket in &self.buckets {
            all.extend(bucket.lock().entries.iter().cloned());
        }
        all.sort_by_key(|tx| (tx.bucket(), tx.label()));
        all
    }

    /// Diagnostic views ordered by `(bucket, label)`. Bucket locks are
    /// released before any transaction is inspected.
    pub fn snapshot(&self, now: Instant) -> Vec<TransactionSnapshot> {
        self.transactions().iter().map(|tx| tx.snapshot(now)).collect()
    }

    /// Unlink everything; returns the removed transactions.
    pub fn clear(&self) -> Vec<Arc<Transaction>> {
        let mut removed = Vec::new();
        for bucket in &self.buckets {
            let mut bucket = bucket.lock();
            for tx in bucket.entries.drain(..) {
                tx.set_flag(flags::UNLINKED);
                self.len.fetch_sub(1, Ordering::AcqRel);
                removed.push(tx);
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MatchingMode;
    use crate::transport::Destination;
    use rvoip_sip_message::{Method, Response, SimpleRequestBuilder, StatusCode};
    use std::time::Duration;

    fn request(method: Method, branch: &str, call_id: &str) -> Request {
        SimpleRequestBuilder::new(method, "sip:bob@example.com")
            .unwrap()
            .via(&format!("SIP/2.0/UDP 192.0.2.1:5060;branch={}", branch))
            .unwrap()
            .from("<sip:alice@example.com>;tag=a")
            .unwrap()
            .to("<sip:bob@example.com>")
            .unwrap()
            .call_id(call_id)
            .cseq(1)
            .build()
            .unwrap()
    }

    fn create(request: &Request) -> impl FnOnce(usize, u32) -> Transaction + '_ {
        move |bucket, label| {
            Transaction::new(
                bucket,
                label,
                request.clone(),
                Some(Destination::udp("192.0.2.1:5060".parse().unwrap())),
                Instant::now(),
                Duration::from_secs(32),
            )
        }
    }

    #[test]
    fn lookup_or_create_matches_retransmissions() {
        let table = TransactionTable::new(100, MatchingOptions::default());
        assert_eq!(table.bucket_count(), 128);
        let invite = request(Method::Invite, "z9hG4bK1", "c1");
        let (tx, created) = table.lookup_or_create(&invite, create(&invite));
        assert!(created);
        let (again, created) = table.lookup_or_create(&invite, create(&invite));
        assert!(!created);
        assert!(Arc::ptr_eq(&tx, &again));
        assert_eq!(table.len(), 1);

        let ack = request(Method::Ack, "z9hG4bK1", "c1");
        assert!(table.find(&TransactionKey::from_request(&ack)).is_some());
        let cancel = request(Method::Cancel, "z9hG4bK1", "c1");
        assert!(table.find(&TransactionKey::from_request(&cancel)).is_none());
        assert!(Arc::ptr_eq(&table.find_cancel_target(&cancel).unwrap(), &tx));
    }

    #[test]
    fn labels_increase_per_bucket_and_ids_resolve() {
        let table = TransactionTable::new(1, MatchingOptions::default());
        let a = request(Method::Options, "z9hG4bKa", "c1");
        let b = request(Method::Options, "z9hG4bKb", "c2");
        let (ta, _) = table.lookup_or_create(&a, create(&a));
        let (tb, _) = table.lookup_or_create(&b, create(&b));
        assert_eq!((ta.label(), tb.label()), (0, 1));
        assert!(Arc::ptr_eq(&table.find_by_branch(&tb.branch_id(0)).unwrap(), &tb));
        assert!(table.find_by_branch(&BranchId::new(7, 0, 0)).is_none());
        let labels: Vec<u32> = table.snapshot(Instant::now()).iter().map(|s| s.label).collect();
        assert_eq!(labels, vec![0, 1]);
    }

    #[test]
    fn remove_is_idempotent_and_drops_the_reference() {
        let table = TransactionTable::new(16, MatchingOptions::default());
        let invite = request(Method::Invite, "z9hG4bK2", "c3");
        let (tx, _) = table.lookup_or_create(&invite, create(&invite));
        assert_eq!(Arc::strong_count(&tx), 2);
        assert!(table.remove(&tx));
        assert!(!table.remove(&tx));
        assert!(!tx.is_linked());
        assert_eq!(Arc::strong_count(&tx), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn local_transactions_never_match() {
        let table = TransactionTable::new(16, MatchingOptions::default());
        let invite = request(Method::Invite, "z9hG4bK3", "c4");
        let local = table.insert_local(&invite, |bucket, label| {
            Transaction::new(bucket, label, invite.clone(), None, Instant::now(), Duration::from_secs(180))
        });
        assert!(local.is_local());
        assert!(table.find(&TransactionKey::from_request(&invite)).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn legacy_mode_and_e2e_ack() {
        let options = MatchingOptions {
            mode: MatchingMode::Legacy,
            ..Default::default()
        };
        let table = TransactionTable::new(16, options);
        let invite = request(Method::Invite, "z9hG4bK4", "c5");
        let (tx, _) = table.lookup_or_create(&invite, create(&invite));
        // a different branch still matches in legacy mode
        let dup = request(Method::Invite, "z9hG4bKother", "c5");
        assert!(!table.lookup_or_create(&dup, create(&dup)).1);

        let ok = Response::from_request(&invite, StatusCode::OK, None).with_to_tag("callee");
        tx.record_upstream(&ok);
        let mut ack = request(Method::Ack, "z9hG4bK5", "c5");
        ack.to.set_tag("callee");
        assert!(Arc::ptr_eq(&table.find_e2e_ack_target(&ack).unwrap(), &tx));
        ack.to.set_tag("stranger");
        assert!(table.find_e2e_ack_target(&ack).is_none());
    }
}
