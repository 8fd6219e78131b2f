//! Transaction engine configuration
//!
//! All knobs the engine consumes, with serde support so a deployment can keep
//! them in a JSON document, and `with_*` builders for code.
//!
//! ```rust
//! use rvoip_transaction_core::config::{MatchingMode, TmConfig};
//! use std::time::Duration;
//!
//! let config = TmConfig::default()
//!     .with_matching_mode(MatchingMode::Legacy)
//!     .with_fr_timeout(Duration::from_secs(10))
//!     .with_dns_failover(false);
//! assert!(config.validate().is_ok());
//!
//! let from_json = TmConfig::from_json_str(r#"{ "max_branches": 4 }"#).unwrap();
//! assert_eq!(from_json.max_branches, 4);
//! assert_eq!(from_json.timers.t1, Duration::from_millis(500));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::blacklist::HealthFlags;
use crate::error::{Error, Result};
use crate::timer::TimerSettings;

/// How an inbound request is matched against existing transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MatchingMode {
    /// RFC 3261 matching on the top Via branch for requests carrying the
    /// magic cookie; requests without it fall back to legacy matching.
    #[default]
    BranchAware,
    /// RFC 2543 matching on Call-ID / CSeq / tags (and optionally R-URI and
    /// top Via) for every request.
    Legacy,
}

/// Destination health cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlacklistConfig {
    pub enabled: bool,
    /// Memory ceiling in bytes
    pub max_mem: usize,
    /// Quarantine applied when the caller does not supply one
    pub default_timeout: Duration,
    pub min_timeout: Duration,
    pub max_timeout: Duration,
    /// Flag destinations answering 503
    pub on_503: bool,
    /// Flag destinations that never answered before the final-response timeout
    pub on_timeout: bool,
    /// Flag destinations whose local send failed
    pub on_send_error: bool,
    /// Still try flagged destinations when no healthy one is left
    pub try_flagged: bool,
    /// Error classes that are never recorded
    pub ignore_mask: u8,
    /// Period of the expired-entry sweep
    pub cleanup_interval: Duration,
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_mem: 250 * 1024,
            default_timeout: Duration::from_secs(60),
            min_timeout: Duration::from_secs(1),
            max_timeout: Duration::from_secs(3600),
            on_503: true,
            on_timeout: true,
            on_send_error: true,
            try_flagged: false,
            ignore_mask: 0,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl BlacklistConfig {
    pub fn ignore_flags(&self) -> HealthFlags {
        HealthFlags::from_bits(self.ignore_mask)
    }

    /// Clamp a requested quarantine into `[min_timeout, max_timeout]`.
    pub fn clamp_timeout(&self, requested: Option<Duration>) -> Duration {
        requested
            .unwrap_or(self.default_timeout)
            .clamp(self.min_timeout, self.max_timeout.max(self.min_timeout))
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TmConfig {
    pub matching_mode: MatchingMode,
    /// Legacy matching also compares the Request-URI (non-ACK requests)
    pub legacy_ruri_matching: bool,
    /// Legacy matching also compares the top Via
    pub legacy_via1_matching: bool,
    pub timers: TimerSettings,
    /// Number of table buckets, rounded up to a power of two
    pub table_buckets: usize,
    pub max_branches: usize,
    pub use_dns_failover: bool,
    pub blacklist: BlacklistConfig,
    /// Seed of locally generated To tags
    pub server_signature: String,
}

impl Default for TmConfig {
    fn default() -> Self {
        Self {
            matching_mode: MatchingMode::BranchAware,
            legacy_ruri_matching: true,
            legacy_via1_matching: false,
            timers: TimerSettings::default(),
            table_buckets: 4096,
            max_branches: 12,
            use_dns_failover: true,
            blacklist: BlacklistConfig::default(),
            server_signature: "rvoip-tm".to_string(),
        }
    }
}

impl TmConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a (possibly partial) JSON document; absent fields keep defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: TmConfig = serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_matching_mode(mut self, mode: MatchingMode) -> Self {
        self.matching_mode = mode;
        self
    }

    pub fn with_timers(mut self, timers: TimerSettings) -> Self {
        self.timers = timers;
        self
    }

    pub fn with_t1(mut self, t1: Duration) -> Self {
        self.timers.t1 = t1;
        self
    }

    pub fn with_t2(mut self, t2: Duration) -> Self {
        self.timers.t2 = t2;
        self
    }

    pub fn with_fr_timeout(mut self, timeout: Duration) -> Self {
        self.timers.fr_timeout = timeout;
        self
    }

    pub fn with_fr_inv_timeout(mut self, timeout: Duration) -> Self {
        self.timers.fr_inv_timeout = timeout;
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.timers.wait_timeout = timeout;
        self
    }

    pub fn with_table_buckets(mut self, buckets: usize) -> Self {
        self.table_buckets = buckets;
        self
    }

    pub fn with_max_branches(mut self, max: usize) -> Self {
        self.max_branches = max;
        self
    }

    pub fn with_dns_failover(mut self, enabled: bool) -> Self {
        self.use_dns_failover = enabled;
        self
    }

    pub fn with_blacklist(mut self, blacklist: BlacklistConfig) -> Self {
        self.blacklist = blacklist;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.timers.validate().map_err(Error::Config)?;
        if self.table_buckets == 0 {
            return Err(Error::Config("table_buckets must be positive".into()));
        }
        if self.max_branches == 0 {
            return Err(Error::Config("max_branches must be positive".into()));
        }
        if self.blacklist.min_timeout > self.blacklist.max_timeout {
            return Err(Error::Config(format!(
                "blacklist min_timeout {:?} exceeds max_timeout {:?}",
                self.blacklist.min_timeout, self.blacklist.max_timeout
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TmConfig::default();
        assert_eq!(config.matching_mode, MatchingMode::BranchAware);
        assert_eq!(config.blacklist.max_mem, 250 * 1024);
        assert_eq!(config.blacklist.default_timeout, Duration::from_secs(60));
        assert!(config.use_dns_failover);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_round_trip_keeps_everything() {
        let config = TmConfig::default()
            .with_matching_mode(MatchingMode::Legacy)
            .with_wait_timeout(Duration::from_secs(2));
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(TmConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn test_json_rejects_invalid() {
        assert!(TmConfig::from_json_str(r#"{ "max_branches": 0 }"#).is_err());
        assert!(TmConfig::from_json_str(r#"{ "matching_mode": "fuzzy" }"#).is_err());
        assert!(TmConfig::from_json_str(r#"{ "matching_mode": "legacy" }"#).is_ok());
    }

    #[test]
    fn test_clamp_timeout() {
        let bl = BlacklistConfig::default();
        assert_eq!(bl.clamp_timeout(None), Duration::from_secs(60));
        assert_eq!(bl.clamp_timeout(Some(Duration::ZERO)), Duration::from_secs(1));
        assert_eq!(bl.clamp_timeout(Some(Duration::from_secs(99_999))), Duration::from_secs(3600));
    }
}
