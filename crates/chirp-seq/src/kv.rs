//! Shared key-value store seam for the sequence allocator.
//!
//! All cross-process coordination happens through server-side atomic scripts
//! on this store; the trait exposes the scripts' observable outcomes as typed
//! values so callers never see raw reply tags. Two implementations exist:
//! [`redis::RedisSeqKv`] for production and [`memory::MemorySeqKv`] for tests
//! and single-process embedding.

pub mod memory;
pub mod redis;

use std::time::Duration;

use futures::future::BoxFuture;

use crate::error::SeqResult;

/// Outcome of one step of the allocation script against a range key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MallocStep {
    /// The cached range covered the request; `curr` is the first owned seq.
    Ranged { curr: i64, last: i64 },
    /// The key was absent. The caller now holds `lock` and must reserve a
    /// fresh range durably, then publish it.
    MustFill { lock: i64 },
    /// Another holder is refilling; wait and retry.
    Locked,
    /// The cached range ran out mid-request. The caller owns the remaining
    /// prefix `curr..last` plus `lock`, and must extend the range durably.
    Exhausted { curr: i64, last: i64, lock: i64 },
}

/// Outcome of publishing a refilled range back to the shared KV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The key was locked by us; range replaced and lock cleared.
    Replaced,
    /// The key had expired; range created from scratch.
    Created,
    /// The lock now belongs to someone else; nothing was written.
    LockLost,
}

/// Networked hash/string store with TTLs and atomic server-side scripts.
///
/// Same seam style as a remote-tier client: object-safe, `BoxFuture` methods,
/// consumed through `Arc<dyn SeqKv>`. Implementations must make `malloc_step`
/// and `publish_range` atomic with respect to each other per key.
pub trait SeqKv: Send + Sync {
    /// Run the allocation script: advance `CURR` by `size` within the cached
    /// range, or transition the key toward a refill.
    fn malloc_step(
        &self,
        key: &str,
        size: i64,
        lock_ttl: Duration,
        data_ttl: Duration,
    ) -> BoxFuture<'_, SeqResult<MallocStep>>;

    /// Publish a refilled range, guarded by the lock nonce handed out by
    /// `malloc_step`. Callers must ensure `last >= curr`.
    fn publish_range(
        &self,
        key: &str,
        lock: i64,
        data_ttl: Duration,
        curr: i64,
        last: i64,
    ) -> BoxFuture<'_, SeqResult<PublishOutcome>>;

    /// Pipelined read of the `CURR` field of many range keys. The result has
    /// one entry per input key, `None` where the key or field is absent.
    /// Every key must map to the same hash slot.
    fn read_currs(&self, keys: &[String]) -> BoxFuture<'_, SeqResult<Vec<Option<i64>>>>;

    /// Partition keys into groups safe to use together in one pipelined call.
    fn group_keys_by_slot(&self, keys: Vec<String>) -> Vec<Vec<String>>;

    /// Read an integer string value.
    fn get_i64(&self, key: &str) -> BoxFuture<'_, SeqResult<Option<i64>>>;

    /// Write an integer string value with a TTL.
    fn set_i64(&self, key: &str, value: i64, ttl: Duration) -> BoxFuture<'_, SeqResult<()>>;

    /// Take a soft lock (create-if-absent with TTL). Returns whether the lock
    /// was acquired.
    fn try_lock(&self, key: &str, token: i64, ttl: Duration) -> BoxFuture<'_, SeqResult<bool>>;

    /// Release a soft lock if it still carries `token`.
    fn unlock(&self, key: &str, token: i64) -> BoxFuture<'_, SeqResult<()>>;

    /// Delete keys. Every key must map to the same hash slot.
    fn del(&self, keys: &[String]) -> BoxFuture<'_, SeqResult<()>>;
}
