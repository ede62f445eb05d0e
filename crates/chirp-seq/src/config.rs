use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default TTL for a range key while a refill lock is held (seconds).
///
/// Bounds the unavailability window when a holder dies between reserving a
/// range durably and publishing it back to the shared KV.
const DEFAULT_LOCK_SECS: u64 = 3;

/// Default TTL for a range key in the Ranged state (seconds).
///
/// Effectively "keep hot conversations cached forever"; eviction only costs
/// the unconsumed remainder of the cached range.
const DEFAULT_DATA_SECS: u64 = 365 * 24 * 60 * 60; // 365 days

/// Default TTL for cached min-seq entries (seconds).
const DEFAULT_MIN_SEQ_EXPIRE_SECS: u64 = 60 * 60; // 1 hour

/// Default pause between retries when a key is locked by another holder (ms).
const DEFAULT_RETRY_INTERVAL_MS: u64 = 250;

/// Default number of attempts before a contended call gives up.
const DEFAULT_MAX_RETRIES: u32 = 10;

/// Default extra sequence numbers reserved per refill for group conversations.
const DEFAULT_GROUP_FILL_BASE: i64 = 100;

/// Default extra sequence numbers reserved per refill for 1-to-1 conversations.
const DEFAULT_DIRECT_FILL_BASE: i64 = 50;

/// Tuning knobs for the sequence allocator.
///
/// All fields have production defaults; tests shrink the retry interval to
/// keep contended paths fast.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SeqConfig {
    /// TTL applied to a range key while `LOCK` is set (seconds).
    pub lock_secs: u64,
    /// TTL applied to a range key in the Ranged state (seconds).
    pub data_secs: u64,
    /// TTL applied to cached min-seq values (seconds).
    pub min_seq_expire_secs: u64,
    /// Pause between retries while another holder refills (milliseconds).
    pub retry_interval_ms: u64,
    /// Attempts before a contended `malloc` or cache-aside read gives up.
    pub max_retries: u32,
    /// Extra numbers reserved per refill for group conversations.
    pub group_fill_base: i64,
    /// Extra numbers reserved per refill for 1-to-1 conversations.
    pub direct_fill_base: i64,
}

impl Default for SeqConfig {
    fn default() -> Self {
        Self {
            lock_secs: DEFAULT_LOCK_SECS,
            data_secs: DEFAULT_DATA_SECS,
            min_seq_expire_secs: DEFAULT_MIN_SEQ_EXPIRE_SECS,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            group_fill_base: DEFAULT_GROUP_FILL_BASE,
            direct_fill_base: DEFAULT_DIRECT_FILL_BASE,
        }
    }
}

impl SeqConfig {
    /// Returns a copy with out-of-range values clamped to usable minimums.
    ///
    /// A zero lock TTL would let two holders refill the same key at once, and
    /// a data TTL below the lock TTL would let a published range expire before
    /// a concurrent holder's lock does. Both are clamped rather than rejected.
    pub fn normalized(&self) -> Self {
        let mut cfg = self.clone();
        cfg.lock_secs = cfg.lock_secs.max(1);
        cfg.data_secs = cfg.data_secs.max(cfg.lock_secs);
        cfg.min_seq_expire_secs = cfg.min_seq_expire_secs.max(1);
        cfg.retry_interval_ms = cfg.retry_interval_ms.max(1);
        cfg.max_retries = cfg.max_retries.max(1);
        cfg.group_fill_base = cfg.group_fill_base.max(0);
        cfg.direct_fill_base = cfg.direct_fill_base.max(0);
        cfg
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_secs)
    }

    pub fn data_ttl(&self) -> Duration {
        Duration::from_secs(self.data_secs)
    }

    pub fn min_seq_ttl(&self) -> Duration {
        Duration::from_secs(self.min_seq_expire_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let cfg = SeqConfig::default();
        assert_eq!(cfg.lock_secs, 3);
        assert_eq!(cfg.min_seq_expire_secs, 3600);
        assert_eq!(cfg.retry_interval_ms, 250);
        assert_eq!(cfg.max_retries, 10);
        assert_eq!(cfg.group_fill_base, 100);
        assert_eq!(cfg.direct_fill_base, 50);
    }

    #[test]
    fn normalized_clamps_degenerate_values() {
        let cfg = SeqConfig {
            lock_secs: 0,
            data_secs: 0,
            min_seq_expire_secs: 0,
            retry_interval_ms: 0,
            max_retries: 0,
            group_fill_base: -5,
            direct_fill_base: -1,
        }
        .normalized();
        assert_eq!(cfg.lock_secs, 1);
        assert!(cfg.data_secs >= cfg.lock_secs);
        assert_eq!(cfg.retry_interval_ms, 1);
        assert_eq!(cfg.max_retries, 1);
        assert_eq!(cfg.group_fill_base, 0);
        assert_eq!(cfg.direct_fill_base, 0);
    }
}
