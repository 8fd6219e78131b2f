use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Engine counters. All relaxed atomics; read them through [`TmStats::snapshot`].
#[derive(Debug, Default)]
pub struct TmStats {
    created: AtomicU64,
    created_uas: AtomicU64,
    created_local: AtomicU64,
    waiting: AtomicU64,
    replies_by_class: [AtomicU64; 6],
    local_replies: AtomicU64,
    request_retransmissions: AtomicU64,
    response_retransmissions: AtomicU64,
    timeouts: AtomicU64,
    dns_failovers: AtomicU64,
    blacklist_hits: AtomicU64,
    destroyed: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub created: u64,
    pub created_uas: u64,
    pub created_local: u64,
    pub waiting: u64,
    /// Relayed replies per class, 1xx first
    pub relayed: [u64; 6],
    pub local_replies: u64,
    pub request_retransmissions: u64,
    pub response_retransmissions: u64,
    pub timeouts: u64,
    pub dns_failovers: u64,
    pub blacklist_hits: u64,
    pub destroyed: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl TmStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn transaction_created(&self, local: bool) {
        bump(&self.created);
        if local {
            bump(&self.created_local);
        } else {
            bump(&self.created_uas);
        }
    }

    pub(crate) fn wait_started(&self) {
        bump(&self.waiting);
    }

    /// `was_waiting` leaves the waiting gauge, which saturates at zero.
    pub(crate) fn destroyed(&self, was_waiting: bool) {
        if was_waiting {
            let _ = self
                .waiting
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |w| w.checked_sub(1));
        }
        bump(&self.destroyed);
    }

    pub(crate) fn relayed(&self, class: u16) {
        if let Some(counter) = (class as usize).checked_sub(1).and_then(|i| self.replies_by_class.get(i)) {
            bump(counter);
        }
    }

    pub(crate) fn local_reply(&self) {
        bump(&self.local_replies);
    }

    pub(crate) fn request_retransmitted(&self) {
        bump(&self.request_retransmissions);
    }

    pub(crate) fn response_retransmitted(&self) {
        bump(&self.response_retransmissions);
    }

    pub(crate) fn timeout(&self) {
        bump(&self.timeouts);
    }

    pub(crate) fn dns_failover(&self) {
        bump(&self.dns_failovers);
    }

    pub(crate) fn blacklist_hit(&self) {
        bump(&self.blacklist_hits);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            created: load(&self.created),
            created_uas: load(&self.created_uas),
            created_local: load(&self.created_local),
            waiting: load(&self.waiting),
            relayed: std::array::from_fn(|i| load(&self.replies_by_class[i])),
            local_replies: load(&self.local_replies),
            request_retransmissions: load(&self.request_retransmissions),
            response_retransmissions: load(&self.response_retransmissions),
            timeouts: load(&self.timeouts),
            dns_failovers: load(&self.dns_failovers),
            blacklist_hits: load(&self.blacklist_hits),
            destroyed: load(&self.destroyed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters() {
        let stats = TmStats::new();
        stats.transaction_created(false);
        stats.transaction_created(true);
        stats.relayed(2);
        stats.relayed(6);
        stats.relayed(9);
        stats.wait_started();
        stats.destroyed(true);
        stats.destroyed(true);
        stats.destroyed(false);
        let snap = stats.snapshot();
        assert_eq!((snap.created, snap.created_uas, snap.created_local), (2, 1, 1));
        assert_eq!(snap.relayed, [0, 1, 0, 0, 0, 1]);
        assert_eq!(snap.waiting, 0);
        assert_eq!(snap.destroyed, 3);
    }
}
