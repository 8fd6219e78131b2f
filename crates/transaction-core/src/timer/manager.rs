//! The set of named expiry lists and the owner-side [`TimerSlot`].
//!
//! Each list has its own lock. `tick()` pops every expired entry list by
//! list and returns them to the caller together with the handle they were
//! scheduled under; handlers run with no list lock held. A handler proves it
//! is still current by comparing that handle with the owner's slot under the
//! owner's own lock, so a firing that raced with `cancel`/`reschedule` is
//! recognised as stale and dropped.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::error;

use super::clock::Clock;
use super::list::{EntryId, TimerList};
use super::types::ListId;

/// Identifies one scheduled entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    list: ListId,
    entry: EntryId,
}

impl TimerHandle {
    pub fn list(&self) -> ListId {
        self.list
    }
}

/// Owner-side record of the entry currently scheduled for one purpose.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TimerSlot {
    handle: Option<TimerHandle>,
}

impl TimerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_armed(&self) -> bool {
        self.handle.is_some()
    }

    pub fn handle(&self) -> Option<TimerHandle> {
        self.handle
    }

    /// Whether `fired` is the entry this slot is waiting for.
    pub fn is_current(&self, fired: TimerHandle) -> bool {
        self.handle == Some(fired)
    }

    /// Forget the handle after its entry fired (the entry is already off
    /// its list). Returns false for a stale firing.
    pub fn consume(&mut self, fired: TimerHandle) -> bool {
        if self.is_current(fired) {
            self.handle = None;
            true
        } else {
            false
        }
    }
}

/// Named timer lists sharing one clock.
pub struct TimerManager<P> {
    lists: Vec<Mutex<TimerList<P>>>,
    clock: Arc<dyn Clock>,
}

impl<P> std::fmt::Debug for TimerManager<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerManager")
            .field("scheduled", &self.len())
            .field("clock", &self.clock)
            .finish()
    }
}

impl<P> TimerManager<P> {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            lists: ListId::ALL.iter().map(|_| Mutex::new(TimerList::new())).collect(),
            clock,
        }
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Schedule `payload` to fire `delay` from now on `list`. An entry already
    /// held by `slot` is canceled first, and its payload is returned.
    pub fn schedule(&self, slot: &mut TimerSlot, list: ListId, delay: Duration, payload: P) -> Option<P> {
        let expires = self.clock.now() + delay;
        self.schedule_at(slot, list, expires, payload)
    }

    /// Like [`schedule`](Self::schedule) with an absolute expiry.
    pub fn schedule_at(&self, slot: &mut TimerSlot, list: ListId, expires: Instant, payload: P) -> Option<P> {
        let previous = self.cancel(slot);
        let entry = {
            let mut timers = self.lists[list.index()].lock();
            if list.is_fixed_delay() {
                timers.insert_from_tail(expires, payload)
            } else {
                timers.insert(expires, payload)
            }
        };
        slot.handle = Some(TimerHandle { list, entry });
        previous
    }

    /// Cancel-then-insert; same as `schedule`.
    pub fn reschedule(&self, slot: &mut TimerSlot, list: ListId, new_delay: Duration, payload: P) -> Option<P> {
        self.schedule(slot, list, new_delay, payload)
    }

    /// Disarm `slot`. A no-op returning `None` when nothing is scheduled or the
    /// entry already fired.
    pub fn cancel(&self, slot: &mut TimerSlot) -> Option<P> {
        let handle = slot.handle.take()?;
        self.lists[handle.list.index()].lock().remove(handle.entry)
    }

    /// Pop everything that expired, list by list. Each list lock is held only
    /// while its expired entries are copied out.
    pub fn tick(&self) -> Vec<(TimerHandle, P)> {
        let now = self.clock.now();
        let mut fired = Vec::new();
        for list in ListId::ALL {
            let expired = self.lists[list.index()].lock().pop_expired(now);
            fired.extend(
                expired
                    .into_iter()
                    .map(|(entry, payload)| (TimerHandle { list, entry }, payload)),
            );
        }
        fired
    }

    /// Check every list's links. Corrupted lists are logged and rebuilt;
    /// returns the number of lists that needed repair.
    pub fn verify(&self) -> usize {
        let mut repaired = 0;
        for list in ListId::ALL {
            let mut timers = self.lists[list.index()].lock();
            if let Err(problem) = timers.check_links() {
                error!(invariant = "timer_list_links", list = %list, %problem, "timer list corrupted, relinking");
                timers.relink();
                repaired += 1;
            }
        }
        repaired
    }

    /// Number of scheduled entries over all lists
    pub fn len(&self) -> usize {
        self.lists.iter().map(|l| l.lock().len()).sum()
    }

    pub fn list_len(&self, list: ListId) -> usize {
        self.lists[list.index()].lock().len()
    }

    pub fn is_armed(&self, slot: &TimerSlot) -> bool {
        slot.handle
            .is_some_and(|h| self.lists[h.list.index()].lock().contains(h.entry))
    }

    /// Drop every scheduled entry.
    pub fn clear(&self) -> Vec<P> {
        let mut dropped = Vec::new();
        for list in ListId::ALL {
            dropped.extend(self.lists[list.index()].lock().drain());
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::clock::ManualClock;

    fn manager() -> (TimerManager<&'static str>, ManualClock) {
        let clock = ManualClock::new();
        (TimerManager::new(Arc::new(clock.clone())), clock)
    }

    #[test]
    fn schedule_fire_consume() {
        let (timers, clock) = manager();
        let mut slot = TimerSlot::new();
        timers.schedule(&mut slot, ListId::FinalResponse, Duration::from_secs(30), "fr");
        assert!(timers.is_armed(&slot));

        clock.advance(Duration::from_secs(29));
        assert!(timers.tick().is_empty());
        clock.advance(Duration::from_secs(1));
        let fired = timers.tick();
        assert_eq!(fired.len(), 1);
        let (handle, payload) = fired[0];
        assert_eq!(payload, "fr");
        assert_eq!(handle.list(), ListId::FinalResponse);
        assert!(slot.consume(handle));
        assert!(!slot.is_armed());
    }

    #[test]
    fn cancel_is_idempotent() {
        let (timers, _clock) = manager();
        let mut slot = TimerSlot::new();
        assert_eq!(timers.cancel(&mut slot), None);
        timers.schedule(&mut slot, ListId::Wait, Duration::from_secs(5), "wait");
        assert_eq!(timers.cancel(&mut slot), Some("wait"));
        assert_eq!(timers.cancel(&mut slot), None);
        assert_eq!(timers.len(), 0);
    }

    #[test]
    fn reschedule_replaces_entry_and_stale_firing_is_detected() {
        let (timers, clock) = manager();
        let mut slot = TimerSlot::new();
        timers.schedule(&mut slot, ListId::RetransmitT1, Duration::from_millis(500), "first");
        let first = slot.handle().unwrap();

        let old = timers.reschedule(&mut slot, ListId::Retransmit2T1, Duration::from_secs(1), "second");
        assert_eq!(old, Some("first"));
        assert_eq!(timers.len(), 1);
        assert!(!slot.is_current(first));

        clock.advance(Duration::from_secs(1));
        let fired = timers.tick();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].1, "second");
        assert!(!slot.clone().consume(first));
        assert!(slot.consume(fired[0].0));
    }

    #[test]
    fn tick_drains_all_lists() {
        let (timers, clock) = manager();
        let mut a = TimerSlot::new();
        let mut b = TimerSlot::new();
        let mut c = TimerSlot::new();
        timers.schedule(&mut a, ListId::RetransmitT1, Duration::from_millis(500), "a");
        timers.schedule(&mut b, ListId::Wait, Duration::from_millis(400), "b");
        timers.schedule(&mut c, ListId::General, Duration::from_secs(10), "c");
        clock.advance(Duration::from_millis(600));
        let mut fired: Vec<_> = timers.tick().into_iter().map(|(_, p)| p).collect();
        fired.sort();
        assert_eq!(fired, vec!["a", "b"]);
        assert_eq!(timers.list_len(ListId::General), 1);
        assert_eq!(timers.verify(), 0);
        assert_eq!(timers.clear(), vec!["c"]);
    }
}
