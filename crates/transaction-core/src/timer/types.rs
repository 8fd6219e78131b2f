//! Defines the core types used for driving SIP timers within the transaction layer.
//!
//! This module provides:
//! - [`ListId`]: the named expiry lists every timer entry lives on.
//! - [`TimerSettings`]: configuration for all timer durations.
//! - [`Backoff`]: the retransmission interval sequence of one branch or one
//!   stored response.
//!
//! # Retransmission and timeout timers
//!
//! Over unreliable transports, requests (and INVITE negative responses on
//! the server side) are retransmitted starting at T1 and doubling up to T2.
//! Each stage of that sequence has its own list, so every list only ever
//! receives entries with the same relative delay and insertion from the tail
//! stays O(1):
//!
//! ```text
//!   stage 0  ── RetransmitT1   (T1)
//!   stage 1  ── Retransmit2T1  (2·T1)
//!   stage 2  ── Retransmit4T1  (4·T1)
//!   stage 3+ ── RetransmitT2   (T2)
//! ```
//!
//! Independently, the final-response ("FR") timer bounds how long a branch
//! may wait for any final response, and the wait timer keeps a completed
//! transaction around to absorb retransmissions before it is removed.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The expiry list an entry is scheduled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ListId {
    /// First retransmission, after T1
    RetransmitT1,
    /// Second retransmission, after 2·T1
    Retransmit2T1,
    /// Third retransmission, after 4·T1
    Retransmit4T1,
    /// All later retransmissions, every T2
    RetransmitT2,
    /// Final-response timeout for non-INVITE branches and INVITE branches
    /// without a provisional
    FinalResponse,
    /// Final-response timeout for INVITE branches after a provisional
    FinalResponseInvite,
    /// Wait/cleanup after completion
    Wait,
    /// Arbitrary per-entry delays (dialog / application timers)
    General,
}

impl ListId {
    /// Every list, in tick order.
    pub const ALL: [ListId; 8] = [
        ListId::RetransmitT1,
        ListId::Retransmit2T1,
        ListId::Retransmit4T1,
        ListId::RetransmitT2,
        ListId::FinalResponse,
        ListId::FinalResponseInvite,
        ListId::Wait,
        ListId::General,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }

    /// Whether every entry on this list shares one relative delay, which lets
    /// insertion scan from the tail.
    pub fn is_fixed_delay(self) -> bool {
        !matches!(self, ListId::General)
    }
}

impl fmt::Display for ListId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ListId::RetransmitT1 => "RT_T1",
            ListId::Retransmit2T1 => "RT_2T1",
            ListId::Retransmit4T1 => "RT_4T1",
            ListId::RetransmitT2 => "RT_T2",
            ListId::FinalResponse => "FR",
            ListId::FinalResponseInvite => "FR_INV",
            ListId::Wait => "WAIT",
            ListId::General => "GENERAL",
        };
        f.write_str(name)
    }
}

/// Timer durations, defaults taken from the classic `tm` values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerSettings {
    /// **T1: RTT estimate (default 500 ms).** First retransmission interval.
    pub t1: Duration,

    /// **T2: retransmission ceiling (default 4 s).** Intervals double from T1
    /// and are capped here.
    pub t2: Duration,

    /// **Final-response timeout (default 30 s).** How long a branch waits for
    /// a final response before a local 408 is generated.
    pub fr_timeout: Duration,

    /// **INVITE final-response timeout (default 120 s).** Replaces
    /// `fr_timeout` once an INVITE branch received a provisional response.
    pub fr_inv_timeout: Duration,

    /// **Wait timeout (default 5 s).** Time a completed transaction stays in
    /// the table to absorb retransmissions.
    pub wait_timeout: Duration,

    /// **Maximum INVITE transaction lifetime (default 180 s).**
    pub max_inv_lifetime: Duration,

    /// **Maximum non-INVITE transaction lifetime (default 32 s).**
    pub max_noninv_lifetime: Duration,

    /// Re-arm the final-response timer with `fr_inv_timeout` when an INVITE
    /// branch sees its first provisional response.
    pub restart_fr_on_provisional: bool,

    /// Period of the tick driver.
    pub tick_interval: Duration,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            fr_timeout: Duration::from_secs(30),
            fr_inv_timeout: Duration::from_secs(120),
            wait_timeout: Duration::from_secs(5),
            max_inv_lifetime: Duration::from_secs(180),
            max_noninv_lifetime: Duration::from_secs(32),
            restart_fr_on_provisional: true,
            tick_interval: Duration::from_millis(100),
        }
    }
}

impl TimerSettings {
    /// Interval of retransmission stage `stage` (0-based): `min(T1·2^stage, T2)`.
    pub fn retransmit_interval(&self, stage: u32) -> Duration {
        let factor = 1u32.checked_shl(stage.min(16)).unwrap_or(u32::MAX);
        self.t1.saturating_mul(factor).min(self.t2)
    }

    /// The list a retransmission stage is scheduled on.
    pub fn retransmit_list(&self, stage: u32) -> ListId {
        let interval = self.retransmit_interval(stage);
        if interval >= self.t2 {
            return ListId::RetransmitT2;
        }
        match stage {
            0 => ListId::RetransmitT1,
            1 => ListId::Retransmit2T1,
            2 => ListId::Retransmit4T1,
            _ => ListId::RetransmitT2,
        }
    }

    /// Absolute lifetime ceiling for a transaction class.
    pub fn max_lifetime(&self, is_invite: bool) -> Duration {
        if is_invite {
            self.max_inv_lifetime
        } else {
            self.max_noninv_lifetime
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.t1.is_zero() {
            return Err("t1 must be non-zero".into());
        }
        if self.t2 < self.t1 {
            return Err(format!("t2 ({:?}) must not be below t1 ({:?})", self.t2, self.t1));
        }
        if self.fr_timeout.is_zero() || self.fr_inv_timeout.is_zero() {
            return Err("final response timeouts must be non-zero".into());
        }
        if self.tick_interval.is_zero() {
            return Err("tick_interval must be non-zero".into());
        }
        Ok(())
    }
}

/// Position in the retransmission sequence of one buffer.
///
/// `next()` yields the (list, interval) to arm and advances; intervals are
/// non-decreasing and capped at T2. `hold_at_t2()` jumps straight to the
/// ceiling, used when a non-INVITE branch sees a provisional response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Backoff {
    stage: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stage the next retransmission will be scheduled at
    pub fn stage(&self) -> u32 {
        self.stage
    }

    /// Next (list, interval) pair; advances the stage.
    pub fn next(&mut self, settings: &TimerSettings) -> (ListId, Duration) {
        let list = settings.retransmit_list(self.stage);
        let interval = settings.retransmit_interval(self.stage);
        if list != ListId::RetransmitT2 {
            self.stage += 1;
        }
        (list, interval)
    }

    pub fn hold_at_t2(&mut self) {
        self.stage = u32::MAX;
    }
}
