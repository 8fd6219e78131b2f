//! Destination health cache ("blacklist")
//!
//! Remembers destinations that recently failed, keyed by
//! `(protocol, address, port)`, together with a bitmask describing how they
//! failed and an expiry. The forking engine consults it to move unhealthy
//! destinations behind healthy ones; the response path feeds it on 503s,
//! timeouts and local send errors.
//!
//! The cache is hashed into a fixed number of independently locked buckets.
//! An entry past its expiry is logically absent: lookups and inserts reap
//! expired entries of the bucket they touch, and a periodic sweep
//! ([`DestinationHealthCache::clean_expired`]) reclaims the rest. Memory is
//! accounted per entry and bounded by a configured ceiling; when an insert
//! would cross it, expired entries are swept until usage drops to 14/16 of
//! what it was, and the insert fails if that did not make room.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::BlacklistConfig;
use crate::error::{Error, Result};
use crate::timer::Clock;
use crate::transport::{Destination, Protocol};

/// Number of hash buckets
pub const BLACKLIST_HASH_SIZE: usize = 1024;

/// Error classes recorded for a destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct HealthFlags(u8);

impl HealthFlags {
    pub const SEND_ERROR: HealthFlags = HealthFlags(1);
    pub const CONNECT_ERROR: HealthFlags = HealthFlags(2);
    pub const ICMP_ERROR: HealthFlags = HealthFlags(4);
    pub const TIMEOUT: HealthFlags = HealthFlags(8);
    pub const ERR_503: HealthFlags = HealthFlags(16);
    pub const ADM_PROHIBITED: HealthFlags = HealthFlags(32);
    pub const PERMANENT: HealthFlags = HealthFlags(64);

    const NAMES: [(HealthFlags, &'static str); 7] = [
        (HealthFlags::SEND_ERROR, "send_error"),
        (HealthFlags::CONNECT_ERROR, "connect_error"),
        (HealthFlags::ICMP_ERROR, "icmp_error"),
        (HealthFlags::TIMEOUT, "timeout"),
        (HealthFlags::ERR_503, "503"),
        (HealthFlags::ADM_PROHIBITED, "admin_prohibited"),
        (HealthFlags::PERMANENT, "permanent"),
    ];

    pub const fn empty() -> Self {
        HealthFlags(0)
    }

    pub const fn from_bits(bits: u8) -> Self {
        HealthFlags(bits)
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub const fn contains(&self, other: HealthFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(&self, other: HealthFlags) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for HealthFlags {
    type Output = HealthFlags;
    fn bitor(self, rhs: HealthFlags) -> HealthFlags {
        HealthFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for HealthFlags {
    fn bitor_assign(&mut self, rhs: HealthFlags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for HealthFlags {
    type Output = HealthFlags;
    fn bitand(self, rhs: HealthFlags) -> HealthFlags {
        HealthFlags(self.0 & rhs.0)
    }
}

impl Not for HealthFlags {
    type Output = HealthFlags;
    fn not(self) -> HealthFlags {
        HealthFlags(!self.0)
    }
}

impl fmt::Display for HealthFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

#[derive(Debug, Clone)]
struct HealthEntry {
    protocol: Protocol,
    ip: IpAddr,
    port: u16,
    flags: HealthFlags,
    expires: Instant,
}

impl HealthEntry {
    fn size(&self) -> usize {
        entry_size(&self.ip)
    }

    fn same_key(&self, protocol: Protocol, ip: IpAddr, port: u16) -> bool {
        self.protocol == protocol && self.ip == ip && self.port == port
    }

    /// `Any` on either side matches every protocol.
    fn matches(&self, protocol: Protocol, ip: IpAddr, port: u16) -> bool {
        self.ip == ip
            && self.port == port
            && (self.protocol == protocol || self.protocol == Protocol::Any || protocol == Protocol::Any)
    }
}

fn entry_size(ip: &IpAddr) -> usize {
    let addr_len = match ip {
        IpAddr::V4(_) => 4,
        IpAddr::V6(_) => 16,
    };
    std::mem::size_of::<HealthEntry>() + addr_len
}

/// Administrative view of one entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthEntrySnapshot {
    pub protocol: Protocol,
    pub ip: IpAddr,
    pub port: u16,
    pub flags: u8,
    pub flag_names: String,
    /// Remaining quarantine in whole seconds
    pub expires_in: u64,
}

/// Memory accounting report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemInfo {
    pub used: usize,
    pub max: usize,
    pub entries: usize,
}

/// Bucket distribution report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HashStats {
    pub buckets: usize,
    pub used_buckets: usize,
    pub max_chain: usize,
    pub entries: usize,
}

/// The destination health cache
pub struct DestinationHealthCache {
    buckets: Vec<Mutex<Vec<HealthEntry>>>,
    mem_used: AtomicUsize,
    config: BlacklistConfig,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for DestinationHealthCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestinationHealthCache")
            .field("mem_used", &self.mem_used.load(Ordering::Relaxed))
            .field("max_mem", &self.config.max_mem)
            .finish()
    }
}

impl DestinationHealthCache {
    pub fn new(config: BlacklistConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: (0..BLACKLIST_HASH_SIZE).map(|_| Mutex::new(Vec::new())).collect(),
            mem_used: AtomicUsize::new(0),
            config,
            clock,
        }
    }

    pub fn config(&self) -> &BlacklistConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    // the protocol is left out so wildcard lookups land in the same bucket
    fn bucket_of(ip: &IpAddr, port: u16) -> usize {
        let mut hasher = DefaultHasher::new();
        ip.hash(&mut hasher);
        port.hash(&mut hasher);
        (hasher.finish() as usize) % BLACKLIST_HASH_SIZE
    }

    fn reap(&self, entries: &mut Vec<HealthEntry>, now: Instant) -> usize {
        let before = entries.len();
        let mut freed = 0;
        entries.retain(|e| {
            let live = e.expires > now;
            if !live {
                freed += e.size();
            }
            live
        });
        if freed > 0 {
            self.mem_used.fetch_sub(freed, Ordering::AcqRel);
        }
        before - entries.len()
    }

    /// Account `size` more bytes unless that reaches `max_mem`.
    fn reserve(&self, size: usize) -> bool {
        self.mem_used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used + size < self.config.max_mem).then_some(used + size)
            })
            .is_ok()
    }

    /// Record `flags` for `dest`. An existing entry gets the flags OR-ed in
    /// and its expiry extended; the quarantine is clamped to the configured
    /// bounds. Flags in the ignore mask are dropped.
    pub fn add(&self, flags: HealthFlags, dest: &Destination, timeout: Option<Duration>) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let flags = flags & !self.config.ignore_flags();
        if flags.is_empty() {
            return Ok(());
        }
        let now = self.clock.now();
        let expires = now + self.config.clamp_timeout(timeout);
        let (ip, port) = (dest.ip(), dest.port());
        let bucket = &self.buckets[Self::bucket_of(&ip, port)];

        {
            let mut entries = bucket.lock();
            self.reap(&mut entries, now);
            if let Some(entry) = entries.iter_mut().find(|e| e.same_key(dest.protocol, ip, port)) {
                entry.flags |= flags;
                if entry.expires < expires {
                    entry.expires = expires;
                }
                return Ok(());
            }
        }

        let size = entry_size(&ip);
        if !self.reserve(size) {
            self.clean_expired(self.mem_used.load(Ordering::Acquire) / 16 * 14);
            if !self.reserve(size) {
                let used = self.mem_used.load(Ordering::Acquire);
                warn!(destination = %dest, used, max = self.config.max_mem, "destination blacklist full");
                return Err(Error::BlacklistFull {
                    used,
                    max: self.config.max_mem,
                });
            }
        }

        let mut entries = bucket.lock();
        // another thread may have inserted the same key meanwhile
        if let Some(entry) = entries.iter_mut().find(|e| e.same_key(dest.protocol, ip, port)) {
            self.mem_used.fetch_sub(size, Ordering::AcqRel);
            entry.flags |= flags;
            if entry.expires < expires {
                entry.expires = expires;
            }
            return Ok(());
        }
        entries.push(HealthEntry {
            protocol: dest.protocol,
            ip,
            port,
            flags,
            expires,
        });
        debug!(destination = %dest, %flags, "destination blacklisted");
        Ok(())
    }

    /// Flags currently recorded for `dest` (empty when healthy or expired).
    pub fn check(&self, dest: &Destination) -> HealthFlags {
        if !self.config.enabled {
            return HealthFlags::empty();
        }
        let now = self.clock.now();
        let (ip, port) = (dest.ip(), dest.port());
        let mut entries = self.buckets[Self::bucket_of(&ip, port)].lock();
        self.reap(&mut entries, now);
        entries
            .iter()
            .filter(|e| e.matches(dest.protocol, ip, port))
            .fold(HealthFlags::empty(), |acc, e| acc | e.flags)
    }

    pub fn is_flagged(&self, dest: &Destination) -> bool {
        !self.check(dest).is_empty()
    }

    /// Delete the entries for `dest` (every protocol when `dest` uses `Any`).
    pub fn remove(&self, dest: &Destination) -> bool {
        let now = self.clock.now();
        let (ip, port) = (dest.ip(), dest.port());
        let mut entries = self.buckets[Self::bucket_of(&ip, port)].lock();
        self.reap(&mut entries, now);
        let before = entries.len();
        let mut freed = 0;
        entries.retain(|e| {
            let hit = if dest.protocol == Protocol::Any {
                e.ip == ip && e.port == port
            } else {
                e.same_key(dest.protocol, ip, port)
            };
            if hit {
                freed += e.size();
            }
            !hit
        });
        self.mem_used.fetch_sub(freed, Ordering::AcqRel);
        before != entries.len()
    }

    /// Sweep expired entries until memory usage is at or below `target`
    /// (0 sweeps everything expired). Returns the number of entries removed.
    pub fn clean_expired(&self, target: usize) -> usize {
        let now = self.clock.now();
        let mut removed = 0;
        for bucket in &self.buckets {
            removed += self.reap(&mut bucket.lock(), now);
            if target > 0 && self.mem_used.load(Ordering::Acquire) <= target {
                break;
            }
        }
        if removed > 0 {
            debug!(removed, "blacklist sweep");
        }
        removed
    }

    /// Delete every entry, expired or not.
    pub fn flush(&self) -> usize {
        let mut removed = 0;
        for bucket in &self.buckets {
            let mut entries = bucket.lock();
            let freed: usize = entries.iter().map(HealthEntry::size).sum();
            removed += entries.len();
            entries.clear();
            self.mem_used.fetch_sub(freed, Ordering::AcqRel);
        }
        removed
    }

    /// Live entries, in bucket order.
    pub fn entries(&self) -> Vec<HealthEntrySnapshot> {
        let now = self.clock.now();
        let mut out = Vec::new();
        for bucket in &self.buckets {
            out.extend(bucket.lock().iter().filter(|e| e.expires > now).map(|e| HealthEntrySnapshot {
                protocol: e.protocol,
                ip: e.ip,
                port: e.port,
                flags: e.flags.bits(),
                flag_names: e.flags.to_string(),
                expires_in: e.expires.duration_since(now).as_secs(),
            }));
        }
        out
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn mem_info(&self) -> MemInfo {
        MemInfo {
            used: self.mem_used.load(Ordering::Acquire),
            max: self.config.max_mem,
            entries: self.len(),
        }
    }

    pub fn hash_stats(&self) -> HashStats {
        let sizes: Vec<usize> = self.buckets.iter().map(|b| b.lock().len()).collect();
        HashStats {
            buckets: sizes.len(),
            used_buckets: sizes.iter().filter(|&&n| n > 0).count(),
            max_chain: sizes.iter().copied().max().unwrap_or(0),
            entries: sizes.iter().sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::ManualClock;

    fn cache(config: BlacklistConfig) -> (DestinationHealthCache, ManualClock) {
        let clock = ManualClock::new();
        (DestinationHealthCache::new(config, Arc::new(clock.clone())), clock)
    }

    fn udp(s: &str) -> Destination {
        Destination::udp(s.parse().unwrap())
    }

    #[test]
    fn add_check_expire() {
        let (bl, clock) = cache(BlacklistConfig::default());
        let dst = udp("192.0.2.10:5060");
        bl.add(HealthFlags::TIMEOUT, &dst, Some(Duration::from_secs(10))).unwrap();
        assert_eq!(bl.check(&dst), HealthFlags::TIMEOUT);
        assert!(!bl.is_flagged(&udp("192.0.2.10:5061")));

        clock.advance(Duration::from_secs(10));
        assert!(bl.check(&dst).is_empty());
        // the lookup reaped it
        assert_eq!(bl.len(), 0);
        assert_eq!(bl.mem_info().used, 0);
    }

    #[test]
    fn add_merges_flags_and_extends_expiry() {
        let (bl, clock) = cache(BlacklistConfig::default());
        let dst = udp("192.0.2.11:5060");
        bl.add(HealthFlags::SEND_ERROR, &dst, Some(Duration::from_secs(5))).unwrap();
        bl.add(HealthFlags::ERR_503, &dst, Some(Duration::from_secs(20))).unwrap();
        assert_eq!(bl.len(), 1);
        clock.advance(Duration::from_secs(6));
        assert_eq!(bl.check(&dst), HealthFlags::SEND_ERROR | HealthFlags::ERR_503);
    }

    #[test]
    fn any_protocol_is_a_wildcard() {
        let (bl, _clock) = cache(BlacklistConfig::default());
        let addr = "198.51.100.1:5060".parse().unwrap();
        bl.add(HealthFlags::CONNECT_ERROR, &Destination::new(Protocol::Tcp, addr), None).unwrap();
        assert!(bl.is_flagged(&Destination::new(Protocol::Any, addr)));
        assert!(!bl.is_flagged(&Destination::new(Protocol::Udp, addr)));

        bl.add(HealthFlags::PERMANENT, &Destination::new(Protocol::Any, addr), None).unwrap();
        assert_eq!(bl.check(&Destination::new(Protocol::Udp, addr)), HealthFlags::PERMANENT);
        assert!(bl.remove(&Destination::new(Protocol::Any, addr)));
        assert!(bl.is_empty());
    }

    #[test]
    fn ignore_mask_and_disabled() {
        let (bl, _clock) = cache(BlacklistConfig {
            ignore_mask: HealthFlags::TIMEOUT.bits(),
            ..Default::default()
        });
        let dst = udp("192.0.2.12:5060");
        bl.add(HealthFlags::TIMEOUT, &dst, None).unwrap();
        assert!(bl.is_empty());

        let (off, _clock) = cache(BlacklistConfig {
            enabled: false,
            ..Default::default()
        });
        off.add(HealthFlags::SEND_ERROR, &dst, None).unwrap();
        assert!(off.is_empty());
        assert!(!off.is_flagged(&dst));
    }

    #[test]
    fn memory_ceiling_sweeps_then_fails() {
        let ceiling = entry_size(&"10.0.0.1".parse().unwrap()) * 3;
        let (bl, clock) = cache(BlacklistConfig {
            max_mem: ceiling,
            ..Default::default()
        });
        bl.add(HealthFlags::SEND_ERROR, &udp("10.0.0.1:5060"), Some(Duration::from_secs(5))).unwrap();
        bl.add(HealthFlags::SEND_ERROR, &udp("10.0.0.2:5060"), Some(Duration::from_secs(60))).unwrap();
        let err = bl.add(HealthFlags::SEND_ERROR, &udp("10.0.0.3:5060"), None).unwrap_err();
        assert!(matches!(err, Error::BlacklistFull { .. }));

        // once the first entry expired the sweep makes room
        clock.advance(Duration::from_secs(5));
        bl.add(HealthFlags::SEND_ERROR, &udp("10.0.0.3:5060"), None).unwrap();
        assert_eq!(bl.len(), 2);
        assert!(bl.mem_info().used < bl.mem_info().max);
    }

    #[test]
    fn concurrent_adds_respect_the_ceiling() {
        let size = entry_size(&"10.1.0.1".parse().unwrap());
        let (bl, _clock) = cache(BlacklistConfig {
            max_mem: size * 8 + 1,
            ..Default::default()
        });
        let full = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for t in 0..4 {
                let (bl, full) = (&bl, &full);
                scope.spawn(move || {
                    for i in 0..16 {
                        let dst = udp(&format!("10.1.{}.{}:5060", t, i + 1));
                        if bl.add(HealthFlags::SEND_ERROR, &dst, None).is_err() {
                            full.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });
        let info = bl.mem_info();
        assert_eq!(info.entries, 8);
        assert_eq!(info.used, size * 8);
        assert_eq!(full.load(Ordering::Relaxed), 64 - 8);
    }

    #[test]
    fn concurrent_adds_of_one_key_account_once() {
        let (bl, _clock) = cache(BlacklistConfig::default());
        let dst = udp("10.2.0.1:5060");
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..50 {
                        bl.add(HealthFlags::TIMEOUT, &dst, None).unwrap();
                    }
                });
            }
        });
        assert_eq!(bl.len(), 1);
        assert_eq!(bl.mem_info().used, entry_size(&dst.ip()));
    }

    #[test]
    fn flush_and_listing() {
        let (bl, _clock) = cache(BlacklistConfig::default());
        bl.add(HealthFlags::ERR_503, &udp("192.0.2.20:5060"), Some(Duration::from_secs(30))).unwrap();
        bl.add(HealthFlags::ICMP_ERROR, &udp("[2001:db8::5]:5060"), None).unwrap();
        let listed = bl.entries();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().any(|e| e.flag_names == "503" && e.expires_in == 30));
        assert_eq!(bl.hash_stats().entries, 2);
        assert_eq!(bl.flush(), 2);
        assert_eq!(bl.mem_info().used, 0);
    }
}
