//! Sorted-expiry list over a slot arena.
//!
//! Entries live in a `Vec` of slots and are threaded into a doubly linked
//! order by slot index. A slot is linked iff it holds a payload; freeing a
//! slot bumps its generation so that stale [`EntryId`]s never match a reused
//! slot. Ties on expiry keep insertion order from either end.

use tokio::time::Instant;

/// Stable handle to one list entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    expires: Instant,
    prev: Option<u32>,
    next: Option<u32>,
    payload: Option<T>,
}

/// A list of payloads ordered by absolute expiry.
#[derive(Debug)]
pub struct TimerList<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

impl<T> Default for TimerList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerList<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Expiry of the earliest entry
    pub fn next_expiry(&self) -> Option<Instant> {
        self.head.map(|h| self.slots[h as usize].expires)
    }

    pub fn contains(&self, id: EntryId) -> bool {
        self.slots
            .get(id.index as usize)
            .is_some_and(|s| s.generation == id.generation && s.payload.is_some())
    }

    /// Insert scanning backwards from the tail. O(1) when `expires` is not
    /// earlier than the current tail, which is the normal case for a list
    /// whose entries all share one relative delay.
    pub fn insert_from_tail(&mut self, expires: Instant, payload: T) -> EntryId {
        let mut after = self.tail;
        while let Some(i) = after {
            if self.slots[i as usize].expires <= expires {
                break;
            }
            after = self.slots[i as usize].prev;
        }
        self.link_after(after, expires, payload)
    }

    /// Insert scanning forwards from the head.
    pub fn insert_from_head(&mut self, expires: Instant, payload: T) -> EntryId {
        let mut after = None;
        let mut cursor = self.head;
        while let Some(i) = cursor {
            if self.slots[i as usize].expires > expires {
                break;
            }
            after = Some(i);
            cursor = self.slots[i as usize].next;
        }
        self.link_after(after, expires, payload)
    }

    /// Insert from whichever end is closer in time to `expires`.
    pub fn insert(&mut self, expires: Instant, payload: T) -> EntryId {
        match (self.head, self.tail) {
            (Some(h), Some(t)) => {
                let head_at = self.slots[h as usize].expires;
                let tail_at = self.slots[t as usize].expires;
                if expires >= tail_at {
                    self.insert_from_tail(expires, payload)
                } else if expires < head_at {
                    self.insert_from_head(expires, payload)
                } else if expires.duration_since(head_at) <= tail_at.duration_since(expires) {
                    self.insert_from_head(expires, payload)
                } else {
                    self.insert_from_tail(expires, payload)
                }
            }
            _ => self.insert_from_tail(expires, payload),
        }
    }

    /// Unlink an entry. Returns `None` if the id is not (or no longer) linked.
    pub fn remove(&mut self, id: EntryId) -> Option<T> {
        if !self.contains(id) {
            return None;
        }
        self.unlink(id.index)
    }

    /// Unlink and return every entry whose expiry is at or before `now`,
    /// earliest first.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<(EntryId, T)> {
        let mut expired = Vec::new();
        while let Some(h) = self.head {
            let slot = &self.slots[h as usize];
            if slot.expires > now {
                break;
            }
            let id = EntryId {
                index: h,
                generation: slot.generation,
            };
            match self.unlink(h) {
                Some(payload) => expired.push((id, payload)),
                None => break,
            }
        }
        expired
    }

    /// Unlink everything, earliest first.
    pub fn drain(&mut self) -> Vec<T> {
        let mut all = Vec::with_capacity(self.len);
        while let Some(h) = self.head {
            match self.unlink(h) {
                Some(payload) => all.push(payload),
                None => break,
            }
        }
        all
    }

    /// Expiries in list order.
    pub fn expiries(&self) -> Vec<Instant> {
        let mut out = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(i) = cursor {
            if out.len() > self.len {
                break;
            }
            out.push(self.slots[i as usize].expires);
            cursor = self.slots[i as usize].next;
        }
        out
    }

    /// Verify link consistency: prev/next agree, order is sorted, the walk
    /// reaches exactly `len` linked slots and ends at `tail`.
    pub fn check_links(&self) -> Result<(), String> {
        let mut count = 0usize;
        let mut prev: Option<u32> = None;
        let mut cursor = self.head;
        while let Some(i) = cursor {
            let slot = self.slots.get(i as usize).ok_or_else(|| format!("slot {} out of range", i))?;
            if slot.payload.is_none() {
                return Err(format!("slot {} is linked but empty", i));
            }
            if slot.prev != prev {
                return Err(format!("slot {} prev {:?}, expected {:?}", i, slot.prev, prev));
            }
            if let Some(p) = prev {
                if self.slots[p as usize].expires > slot.expires {
                    return Err(format!("slot {} expires before its predecessor {}", i, p));
                }
            }
            count += 1;
            if count > self.len {
                return Err(format!("walk exceeds len {}", self.len));
            }
            prev = Some(i);
            cursor = slot.next;
        }
        if count != self.len {
            return Err(format!("walked {} entries, len is {}", count, self.len));
        }
        if prev != self.tail {
            return Err(format!("tail {:?}, walk ended at {:?}", self.tail, prev));
        }
        let occupied = self.slots.iter().filter(|s| s.payload.is_some()).count();
        if occupied != self.len {
            return Err(format!("{} occupied slots, len is {}", occupied, self.len));
        }
        Ok(())
    }

    /// Rebuild the order from the occupied slots. Used after `check_links`
    /// reported a problem; entries keep their ids.
    pub fn relink(&mut self) {
        let mut live: Vec<u32> = (0..self.slots.len() as u32)
            .filter(|&i| self.slots[i as usize].payload.is_some())
            .collect();
        live.sort_by_key(|&i| self.slots[i as usize].expires);
        self.head = live.first().copied();
        self.tail = live.last().copied();
        self.len = live.len();
        for (pos, &i) in live.iter().enumerate() {
            let slot = &mut self.slots[i as usize];
            slot.prev = if pos == 0 { None } else { Some(live[pos - 1]) };
            slot.next = live.get(pos + 1).copied();
        }
        self.free = (0..self.slots.len() as u32)
            .filter(|&i| self.slots[i as usize].payload.is_none())
            .collect();
    }

    fn alloc(&mut self, expires: Instant, payload: T) -> u32 {
        match self.free.pop() {
            Some(i) => {
                let slot = &mut self.slots[i as usize];
                slot.expires = expires;
                slot.payload = Some(payload);
                slot.prev = None;
                slot.next = None;
                i
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    expires,
                    prev: None,
                    next: None,
                    payload: Some(payload),
                });
                (self.slots.len() - 1) as u32
            }
        }
    }

    fn link_after(&mut self, after: Option<u32>, expires: Instant, payload: T) -> EntryId {
        let idx = self.alloc(expires, payload);
        let next = match after {
            Some(a) => self.slots[a as usize].next.replace(idx),
            None => self.head.replace(idx),
        };
        {
            let slot = &mut self.slots[idx as usize];
            slot.prev = after;
            slot.next = next;
        }
        match next {
            Some(n) => self.slots[n as usize].prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.len += 1;
        EntryId {
            index: idx,
            generation: self.slots[idx as usize].generation,
        }
    }

    fn unlink(&mut self, idx: u32) -> Option<T> {
        let (prev, next) = {
            let slot = &self.slots[idx as usize];
            (slot.prev, slot.next)
        };
        match prev {
            Some(p) => self.slots[p as usize].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n as usize].prev = prev,
            None => self.tail = prev,
        }
        let slot = &mut self.slots[idx as usize];
        slot.prev = None;
        slot.next = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.len -= 1;
        self.free.push(idx);
        // a linked empty slot is corruption; check_links reports it
        slot.payload.take()
    }
}
