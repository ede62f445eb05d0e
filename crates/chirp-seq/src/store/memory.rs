//! In-memory [`SeqStore`] for tests and single-process embedding.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use parking_lot::Mutex;

use super::SeqStore;
use crate::error::{SeqError, SeqResult};

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    max_seq: i64,
    min_seq: i64,
}

/// Mutexed counter map with the same contract as the LMDB store.
#[derive(Default)]
pub struct MemorySeqStore {
    counters: Mutex<HashMap<String, Counters>>,
    min_seq_reads: AtomicU64,
}

impl MemorySeqStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Peek the durable counter without going through the trait.
    pub fn max_seq(&self, conversation_id: &str) -> i64 {
        self.counters
            .lock()
            .get(conversation_id)
            .map(|c| c.max_seq)
            .unwrap_or(0)
    }

    /// How many `get_min_seq` calls reached this store. Lets tests assert
    /// that cache-aside readers coalesced onto one fetch.
    pub fn min_seq_reads(&self) -> u64 {
        self.min_seq_reads.load(Ordering::Relaxed)
    }

    /// Advance the counter directly, simulating another process that filled
    /// durably without publishing to the cache.
    pub fn bump_max_seq(&self, conversation_id: &str, delta: i64) {
        let mut counters = self.counters.lock();
        counters.entry(conversation_id.to_owned()).or_default().max_seq += delta;
    }
}

impl SeqStore for MemorySeqStore {
    fn malloc(&self, conversation_id: &str, size: i64) -> BoxFuture<'_, SeqResult<i64>> {
        let conversation_id = conversation_id.to_owned();
        Box::pin(async move {
            if size < 0 {
                return Err(SeqError::invalid_argument(format!(
                    "reservation size must be non-negative, got {size}"
                )));
            }
            let mut counters = self.counters.lock();
            let entry = counters.entry(conversation_id).or_default();
            let previous = entry.max_seq;
            entry.max_seq = previous
                .checked_add(size)
                .ok_or_else(|| SeqError::internal("sequence counter overflow"))?;
            Ok(previous)
        })
    }

    fn get_min_seq(&self, conversation_id: &str) -> BoxFuture<'_, SeqResult<i64>> {
        let conversation_id = conversation_id.to_owned();
        Box::pin(async move {
            self.min_seq_reads.fetch_add(1, Ordering::Relaxed);
            let counters = self.counters.lock();
            Ok(counters.get(&conversation_id).map(|c| c.min_seq).unwrap_or(0))
        })
    }

    fn set_min_seq(&self, conversation_id: &str, min_seq: i64) -> BoxFuture<'_, SeqResult<()>> {
        let conversation_id = conversation_id.to_owned();
        Box::pin(async move {
            let mut counters = self.counters.lock();
            let entry = counters.entry(conversation_id).or_default();
            entry.min_seq = entry.min_seq.max(min_seq);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn malloc_returns_previous_counter() {
        let store = MemorySeqStore::new();
        assert_eq!(store.malloc("c", 10).await.unwrap(), 0);
        assert_eq!(store.malloc("c", 5).await.unwrap(), 10);
        assert_eq!(store.malloc("c", 0).await.unwrap(), 15);
        assert_eq!(store.max_seq("c"), 15);
    }

    #[tokio::test]
    async fn min_seq_never_regresses() {
        let store = MemorySeqStore::new();
        store.set_min_seq("c", 7).await.unwrap();
        store.set_min_seq("c", 3).await.unwrap();
        assert_eq!(store.get_min_seq("c").await.unwrap(), 7);
    }
}
