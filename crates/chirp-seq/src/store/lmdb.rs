//! LMDB-backed [`SeqStore`].
//!
//! One tiny record per conversation in a single named database. LMDB allows a
//! single write transaction at a time, which is exactly the serialization the
//! counter contract needs: a reservation is a get/put/commit under the write
//! lock, so two reservations can never observe the same counter value. Calls
//! run on the blocking pool.

use std::path::Path;

use futures::future::BoxFuture;
use heed::types::{SerdeBincode, Str};
use heed::{Database, Env, EnvOpenOptions};
use serde::{Deserialize, Serialize};

use super::SeqStore;
use crate::error::{SeqError, SeqResult};

/// Default LMDB map size. Counter records are a few dozen bytes each, so this
/// is effectively unbounded for any realistic conversation population.
const DEFAULT_MAP_SIZE: usize = 256 * 1024 * 1024; // 256 MiB

/// Current version of the counter record format.
const COUNTER_RECORD_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct CounterRecord {
    record_version: u16,
    max_seq: i64,
    min_seq: i64,
}

impl Default for CounterRecord {
    fn default() -> Self {
        Self {
            record_version: COUNTER_RECORD_VERSION,
            max_seq: 0,
            min_seq: 0,
        }
    }
}

/// Open options for [`LmdbSeqStore`].
#[derive(Debug, Clone, Copy)]
pub struct LmdbStoreOptions {
    pub map_size: usize,
}

impl Default for LmdbStoreOptions {
    fn default() -> Self {
        Self {
            map_size: DEFAULT_MAP_SIZE,
        }
    }
}

/// Durable counter store on an LMDB environment.
#[derive(Clone)]
pub struct LmdbSeqStore {
    env: Env,
    counters: Database<Str, SerdeBincode<CounterRecord>>,
}

impl LmdbSeqStore {
    /// Open (or create) the store under `path` with default options.
    pub fn open(path: impl AsRef<Path>) -> SeqResult<Self> {
        Self::open_with(path, LmdbStoreOptions::default())
    }

    pub fn open_with(path: impl AsRef<Path>, options: LmdbStoreOptions) -> SeqResult<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path).map_err(SeqError::store)?;
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(options.map_size)
                .max_dbs(1)
                .open(path)
                .map_err(SeqError::store)?
        };
        let counters = {
            let mut txn = env.write_txn().map_err(SeqError::store)?;
            let counters = env
                .create_database::<Str, SerdeBincode<CounterRecord>>(&mut txn, Some("seq_counters"))
                .map_err(SeqError::store)?;
            txn.commit().map_err(SeqError::store)?;
            counters
        };
        Ok(Self { env, counters })
    }

    fn update_blocking<F>(&self, conversation_id: String, apply: F) -> BoxFuture<'_, SeqResult<i64>>
    where
        F: FnOnce(&mut CounterRecord) -> SeqResult<i64> + Send + 'static,
    {
        let env = self.env.clone();
        let counters = self.counters;
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                let mut txn = env.write_txn().map_err(SeqError::store)?;
                let mut record = counters
                    .get(&txn, &conversation_id)
                    .map_err(SeqError::store)?
                    .unwrap_or_default();
                let result = apply(&mut record)?;
                counters
                    .put(&mut txn, &conversation_id, &record)
                    .map_err(SeqError::store)?;
                txn.commit().map_err(SeqError::store)?;
                Ok(result)
            })
            .await
            .map_err(|err| SeqError::internal(format!("blocking task failed: {err}")))?
        })
    }
}

impl SeqStore for LmdbSeqStore {
    fn malloc(&self, conversation_id: &str, size: i64) -> BoxFuture<'_, SeqResult<i64>> {
        if size < 0 {
            let err = SeqError::invalid_argument(format!(
                "reservation size must be non-negative, got {size}"
            ));
            return Box::pin(async move { Err(err) });
        }
        if size == 0 {
            // Pure read, no write transaction needed.
            let env = self.env.clone();
            let counters = self.counters;
            let conversation_id = conversation_id.to_owned();
            return Box::pin(async move {
                tokio::task::spawn_blocking(move || {
                    let txn = env.read_txn().map_err(SeqError::store)?;
                    let record = counters
                        .get(&txn, &conversation_id)
                        .map_err(SeqError::store)?;
                    Ok(record.map(|r| r.max_seq).unwrap_or(0))
                })
                .await
                .map_err(|err| SeqError::internal(format!("blocking task failed: {err}")))?
            });
        }
        self.update_blocking(conversation_id.to_owned(), move |record| {
            let previous = record.max_seq;
            record.max_seq = previous
                .checked_add(size)
                .ok_or_else(|| SeqError::internal("sequence counter overflow"))?;
            Ok(previous)
        })
    }

    fn get_min_seq(&self, conversation_id: &str) -> BoxFuture<'_, SeqResult<i64>> {
        let env = self.env.clone();
        let counters = self.counters;
        let conversation_id = conversation_id.to_owned();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                let txn = env.read_txn().map_err(SeqError::store)?;
                let record = counters
                    .get(&txn, &conversation_id)
                    .map_err(SeqError::store)?;
                Ok(record.map(|r| r.min_seq).unwrap_or(0))
            })
            .await
            .map_err(|err| SeqError::internal(format!("blocking task failed: {err}")))?
        })
    }

    fn set_min_seq(&self, conversation_id: &str, min_seq: i64) -> BoxFuture<'_, SeqResult<()>> {
        let fut = self.update_blocking(conversation_id.to_owned(), move |record| {
            record.min_seq = record.min_seq.max(min_seq);
            Ok(0)
        });
        Box::pin(async move {
            fut.await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn malloc_is_a_compare_and_add() {
        let dir = TempDir::new().expect("tempdir");
        let store = LmdbSeqStore::open(dir.path()).expect("open");
        assert_eq!(store.malloc("g_1", 110).await.unwrap(), 0);
        assert_eq!(store.malloc("g_1", 105).await.unwrap(), 110);
        assert_eq!(store.malloc("g_1", 0).await.unwrap(), 215);
        // Distinct conversations have independent counters.
        assert_eq!(store.malloc("si_a_b", 55).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn counters_survive_reopen() {
        let dir = TempDir::new().expect("tempdir");
        {
            let store = LmdbSeqStore::open(dir.path()).expect("open");
            store.malloc("g_1", 60).await.unwrap();
            store.set_min_seq("g_1", 12).await.unwrap();
        }
        let store = LmdbSeqStore::open(dir.path()).expect("reopen");
        assert_eq!(store.malloc("g_1", 0).await.unwrap(), 60);
        assert_eq!(store.get_min_seq("g_1").await.unwrap(), 12);
    }

    #[tokio::test]
    async fn negative_reservation_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let store = LmdbSeqStore::open(dir.path()).expect("open");
        let err = store.malloc("g_1", -1).await.unwrap_err();
        assert!(matches!(err, SeqError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn min_seq_never_regresses() {
        let dir = TempDir::new().expect("tempdir");
        let store = LmdbSeqStore::open(dir.path()).expect("open");
        store.set_min_seq("g_1", 30).await.unwrap();
        store.set_min_seq("g_1", 10).await.unwrap();
        assert_eq!(store.get_min_seq("g_1").await.unwrap(), 30);
    }
}
