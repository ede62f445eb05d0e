//! Durable counter store seam.
//!
//! The store owns the authoritative per-conversation counters; the shared KV
//! only ever caches ranges reserved from here. Reservations must be atomic
//! read-modify-writes so that ranges handed to distinct callers can never
//! overlap, even across processes.

pub mod lmdb;
pub mod memory;

use futures::future::BoxFuture;

use crate::error::SeqResult;

/// Authoritative per-conversation sequence counters.
pub trait SeqStore: Send + Sync {
    /// Atomically reserve `size` consecutive sequence numbers, returning the
    /// first of the reserved range (the previous counter value). `size == 0`
    /// is a pure read of the counter.
    fn malloc(&self, conversation_id: &str, size: i64) -> BoxFuture<'_, SeqResult<i64>>;

    /// Read the lowest retained sequence number, `0` if never set.
    fn get_min_seq(&self, conversation_id: &str) -> BoxFuture<'_, SeqResult<i64>>;

    /// Raise the lowest retained sequence number. Lower values than the one
    /// already stored are ignored; the watermark never moves backwards.
    fn set_min_seq(&self, conversation_id: &str, min_seq: i64) -> BoxFuture<'_, SeqResult<()>>;
}
