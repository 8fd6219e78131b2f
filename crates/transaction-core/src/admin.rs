//! Administrative queries
//!
//! Read access to the transaction table and the destination health cache,
//! plus the handful of write operations an operator needs on the cache. All
//! results are serde-serializable snapshots; [`to_json`] renders any of them.

use std::time::Duration;

use serde::Serialize;

use crate::blacklist::{HealthEntrySnapshot, HealthFlags, MemInfo};
use crate::error::Result;
use crate::manager::TransactionManager;
use crate::stats::StatsSnapshot;
use crate::transaction::TransactionSnapshot;
use crate::transport::Destination;

/// Operator-facing view of a running engine.
pub trait AdminQuery {
    /// Every linked transaction, ordered by `(bucket, label)`.
    fn transactions(&self) -> Vec<TransactionSnapshot>;

    fn transaction(&self, bucket: usize, label: u32) -> Option<TransactionSnapshot>;

    /// Flag `destination` by hand. `timeout` is clamped to the configured
    /// bounds; `None` applies the default quarantine.
    fn blacklist_add(&self, destination: &Destination, flags: HealthFlags, timeout: Option<Duration>) -> Result<()>;

    fn blacklist_entries(&self) -> Vec<HealthEntrySnapshot>;

    fn blacklist_remove(&self, destination: &Destination) -> bool;

    /// Drop every entry; returns how many were removed.
    fn blacklist_flush(&self) -> usize;

    fn blacklist_mem_info(&self) -> MemInfo;

    fn stats(&self) -> StatsSnapshot;
}

impl AdminQuery for TransactionManager {
    fn transactions(&self) -> Vec<TransactionSnapshot> {
        let now = self.now();
        self.table_snapshot(now)
    }

    fn transaction(&self, bucket: usize, label: u32) -> Option<TransactionSnapshot> {
        let now = self.now();
        self.find_transaction(bucket, label).map(|tx| tx.snapshot(now))
    }

    fn blacklist_add(&self, destination: &Destination, flags: HealthFlags, timeout: Option<Duration>) -> Result<()> {
        self.blacklist().add(flags, destination, timeout)
    }

    fn blacklist_entries(&self) -> Vec<HealthEntrySnapshot> {
        self.blacklist().entries()
    }

    fn blacklist_remove(&self, destination: &Destination) -> bool {
        self.blacklist().remove(destination)
    }

    fn blacklist_flush(&self) -> usize {
        self.blacklist().flush()
    }

    fn blacklist_mem_info(&self) -> MemInfo {
        self.blacklist().mem_info()
    }

    fn stats(&self) -> StatsSnapshot {
        TransactionManager::stats(self)
    }
}

/// Pretty-printed JSON of an administrative snapshot.
pub fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}
