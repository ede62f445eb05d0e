//! In-process [`SeqKv`] with the same observable semantics as the Redis
//! scripts, including TTL expiry driven by a manually advanceable clock.
//!
//! Used by the test suite (lock-expiry liveness without real sleeps) and
//! usable as the KV tier of a single-process deployment.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use rand::Rng;

use super::{MallocStep, PublishOutcome, SeqKv};
use crate::error::{SeqError, SeqResult};

#[derive(Debug, Clone)]
enum Value {
    /// Range hash: `CURR`/`LAST` fields plus the optional `LOCK` nonce.
    Range {
        curr: Option<i64>,
        last: Option<i64>,
        lock: Option<i64>,
    },
    /// Plain integer string (min-seq cache entries and soft locks).
    Int(i64),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Instant,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    /// Manual addition to the wall clock; tests advance this to expire TTLs.
    clock_skew: Duration,
}

impl State {
    fn now(&self) -> Instant {
        Instant::now() + self.clock_skew
    }

    /// Live entry lookup; expired entries are dropped on access.
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = self.now();
        let expired = self.entries.get(key).is_some_and(|e| e.expires_at <= now);
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get_mut(key)
    }
}

/// Mutexed map implementing the allocation scripts natively.
#[derive(Default)]
pub struct MemorySeqKv {
    state: Mutex<State>,
}

impl MemorySeqKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the TTL clock, expiring everything whose deadline passes.
    pub fn advance(&self, delta: Duration) {
        self.state.lock().clock_skew += delta;
    }

    /// Inspect a range key: `(CURR, LAST, LOCK)` if the key is live.
    pub fn peek_range(&self, key: &str) -> Option<(Option<i64>, Option<i64>, Option<i64>)> {
        let mut state = self.state.lock();
        match state.live(key).map(|e| &e.value) {
            Some(Value::Range { curr, last, lock }) => Some((*curr, *last, *lock)),
            _ => None,
        }
    }

    /// Replace the lock nonce on a range key, simulating a competing holder.
    pub fn override_lock(&self, key: &str, lock: i64) {
        let mut state = self.state.lock();
        if let Some(entry) = state.live(key) {
            if let Value::Range { lock: slot, .. } = &mut entry.value {
                *slot = Some(lock);
            }
        }
    }

    /// Drop a key outright, simulating eviction.
    pub fn force_expire(&self, key: &str) {
        self.state.lock().entries.remove(key);
    }

    fn nonce() -> i64 {
        rand::rng().random_range(0..=999_999_999)
    }
}

impl SeqKv for MemorySeqKv {
    fn malloc_step(
        &self,
        key: &str,
        size: i64,
        lock_ttl: Duration,
        data_ttl: Duration,
    ) -> BoxFuture<'_, SeqResult<MallocStep>> {
        let key = key.to_owned();
        Box::pin(async move {
            let mut state = self.state.lock();
            let now = state.now();
            let Some(entry) = state.live(&key) else {
                let lock = Self::nonce();
                state.entries.insert(
                    key,
                    Entry {
                        value: Value::Range {
                            curr: None,
                            last: None,
                            lock: Some(lock),
                        },
                        expires_at: now + lock_ttl,
                    },
                );
                return Ok(MallocStep::MustFill { lock });
            };
            let Value::Range { curr, last, lock } = &mut entry.value else {
                return Err(SeqError::internal(format!(
                    "range key {key} holds a non-hash value"
                )));
            };
            if lock.is_some() {
                return Ok(MallocStep::Locked);
            }
            let (Some(curr_seq), Some(last_seq)) = (*curr, *last) else {
                return Err(SeqError::internal(format!(
                    "range key {key} is missing CURR/LAST"
                )));
            };
            if size == 0 {
                entry.expires_at = now + data_ttl;
                return Ok(MallocStep::Ranged {
                    curr: curr_seq,
                    last: last_seq,
                });
            }
            if curr_seq + size > last_seq {
                let nonce = Self::nonce();
                *lock = Some(nonce);
                *curr = Some(last_seq);
                entry.expires_at = now + lock_ttl;
                return Ok(MallocStep::Exhausted {
                    curr: curr_seq,
                    last: last_seq,
                    lock: nonce,
                });
            }
            *curr = Some(curr_seq + size);
            entry.expires_at = now + data_ttl;
            Ok(MallocStep::Ranged {
                curr: curr_seq,
                last: last_seq,
            })
        })
    }

    fn publish_range(
        &self,
        key: &str,
        lock: i64,
        data_ttl: Duration,
        curr: i64,
        last: i64,
    ) -> BoxFuture<'_, SeqResult<PublishOutcome>> {
        let key = key.to_owned();
        Box::pin(async move {
            let mut state = self.state.lock();
            let now = state.now();
            let Some(entry) = state.live(&key) else {
                state.entries.insert(
                    key,
                    Entry {
                        value: Value::Range {
                            curr: Some(curr),
                            last: Some(last),
                            lock: None,
                        },
                        expires_at: now + data_ttl,
                    },
                );
                return Ok(PublishOutcome::Created);
            };
            let Value::Range {
                curr: curr_slot,
                last: last_slot,
                lock: lock_slot,
            } = &mut entry.value
            else {
                return Err(SeqError::internal(format!(
                    "range key {key} holds a non-hash value"
                )));
            };
            if *lock_slot != Some(lock) {
                return Ok(PublishOutcome::LockLost);
            }
            *lock_slot = None;
            *curr_slot = Some(curr);
            *last_slot = Some(last);
            entry.expires_at = now + data_ttl;
            Ok(PublishOutcome::Replaced)
        })
    }

    fn read_currs(&self, keys: &[String]) -> BoxFuture<'_, SeqResult<Vec<Option<i64>>>> {
        let keys = keys.to_vec();
        Box::pin(async move {
            let mut state = self.state.lock();
            let currs = keys
                .iter()
                .map(|key| match state.live(key).map(|e| &e.value) {
                    Some(Value::Range { curr, .. }) => *curr,
                    _ => None,
                })
                .collect();
            Ok(currs)
        })
    }

    fn group_keys_by_slot(&self, keys: Vec<String>) -> Vec<Vec<String>> {
        // Single-process store, single slot.
        if keys.is_empty() { vec![] } else { vec![keys] }
    }

    fn get_i64(&self, key: &str) -> BoxFuture<'_, SeqResult<Option<i64>>> {
        let key = key.to_owned();
        Box::pin(async move {
            let mut state = self.state.lock();
            match state.live(&key).map(|e| &e.value) {
                Some(Value::Int(v)) => Ok(Some(*v)),
                _ => Ok(None),
            }
        })
    }

    fn set_i64(&self, key: &str, value: i64, ttl: Duration) -> BoxFuture<'_, SeqResult<()>> {
        let key = key.to_owned();
        Box::pin(async move {
            let mut state = self.state.lock();
            let expires_at = state.now() + ttl;
            state.entries.insert(
                key,
                Entry {
                    value: Value::Int(value),
                    expires_at,
                },
            );
            Ok(())
        })
    }

    fn try_lock(&self, key: &str, token: i64, ttl: Duration) -> BoxFuture<'_, SeqResult<bool>> {
        let key = key.to_owned();
        Box::pin(async move {
            let mut state = self.state.lock();
            if state.live(&key).is_some() {
                return Ok(false);
            }
            let expires_at = state.now() + ttl;
            state.entries.insert(
                key,
                Entry {
                    value: Value::Int(token),
                    expires_at,
                },
            );
            Ok(true)
        })
    }

    fn unlock(&self, key: &str, token: i64) -> BoxFuture<'_, SeqResult<()>> {
        let key = key.to_owned();
        Box::pin(async move {
            let mut state = self.state.lock();
            let held = match state.live(&key).map(|e| &e.value) {
                Some(Value::Int(v)) => Some(*v),
                _ => None,
            };
            if held == Some(token) {
                state.entries.remove(&key);
            }
            Ok(())
        })
    }

    fn del(&self, keys: &[String]) -> BoxFuture<'_, SeqResult<()>> {
        let keys = keys.to_vec();
        Box::pin(async move {
            let mut state = self.state.lock();
            for key in &keys {
                state.entries.remove(key);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCK_TTL: Duration = Duration::from_secs(3);
    const DATA_TTL: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn absent_key_hands_out_lock() {
        let kv = MemorySeqKv::new();
        let step = kv.malloc_step("k", 5, LOCK_TTL, DATA_TTL).await.unwrap();
        let MallocStep::MustFill { lock } = step else {
            panic!("expected MustFill, got {step:?}");
        };
        // A second caller must see the lock.
        let step = kv.malloc_step("k", 5, LOCK_TTL, DATA_TTL).await.unwrap();
        assert_eq!(step, MallocStep::Locked);
        // Publishing with the nonce installs the range and clears the lock.
        let outcome = kv.publish_range("k", lock, DATA_TTL, 5, 55).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Replaced);
        assert_eq!(kv.peek_range("k"), Some((Some(5), Some(55), None)));
    }

    #[tokio::test]
    async fn ranged_key_advances_curr() {
        let kv = MemorySeqKv::new();
        let lock = match kv.malloc_step("k", 0, LOCK_TTL, DATA_TTL).await.unwrap() {
            MallocStep::MustFill { lock } => lock,
            step => panic!("unexpected {step:?}"),
        };
        kv.publish_range("k", lock, DATA_TTL, 10, 110).await.unwrap();

        let step = kv.malloc_step("k", 5, LOCK_TTL, DATA_TTL).await.unwrap();
        assert_eq!(step, MallocStep::Ranged { curr: 10, last: 110 });
        let step = kv.malloc_step("k", 0, LOCK_TTL, DATA_TTL).await.unwrap();
        assert_eq!(step, MallocStep::Ranged { curr: 15, last: 110 });
    }

    #[tokio::test]
    async fn exhaustion_hands_out_prefix_and_lock() {
        let kv = MemorySeqKv::new();
        let lock = match kv.malloc_step("k", 0, LOCK_TTL, DATA_TTL).await.unwrap() {
            MallocStep::MustFill { lock } => lock,
            step => panic!("unexpected {step:?}"),
        };
        kv.publish_range("k", lock, DATA_TTL, 108, 110).await.unwrap();

        let step = kv.malloc_step("k", 5, LOCK_TTL, DATA_TTL).await.unwrap();
        let MallocStep::Exhausted { curr, last, lock } = step else {
            panic!("expected Exhausted, got {step:?}");
        };
        assert_eq!((curr, last), (108, 110));
        // CURR was bumped to LAST so the prefix cannot be handed out twice.
        assert_eq!(kv.peek_range("k"), Some((Some(110), Some(110), Some(lock))));
    }

    #[tokio::test]
    async fn stolen_lock_rejects_publish() {
        let kv = MemorySeqKv::new();
        let lock = match kv.malloc_step("k", 1, LOCK_TTL, DATA_TTL).await.unwrap() {
            MallocStep::MustFill { lock } => lock,
            step => panic!("unexpected {step:?}"),
        };
        kv.override_lock("k", lock.wrapping_add(1));
        let outcome = kv.publish_range("k", lock, DATA_TTL, 1, 51).await.unwrap();
        assert_eq!(outcome, PublishOutcome::LockLost);
    }

    #[tokio::test]
    async fn lock_ttl_expires_key() {
        let kv = MemorySeqKv::new();
        kv.malloc_step("k", 1, LOCK_TTL, DATA_TTL).await.unwrap();
        kv.advance(LOCK_TTL + Duration::from_millis(1));
        // The lock expired with the key, so the next caller restarts cold.
        let step = kv.malloc_step("k", 1, LOCK_TTL, DATA_TTL).await.unwrap();
        assert!(matches!(step, MallocStep::MustFill { .. }));
    }

    #[tokio::test]
    async fn read_currs_reports_absent_keys() {
        let kv = MemorySeqKv::new();
        let lock = match kv.malloc_step("a", 0, LOCK_TTL, DATA_TTL).await.unwrap() {
            MallocStep::MustFill { lock } => lock,
            step => panic!("unexpected {step:?}"),
        };
        kv.publish_range("a", lock, DATA_TTL, 7, 57).await.unwrap();
        let currs = kv
            .read_currs(&["a".into(), "b".into()])
            .await
            .unwrap();
        assert_eq!(currs, vec![Some(7), None]);
    }

    #[tokio::test]
    async fn soft_lock_round_trip() {
        let kv = MemorySeqKv::new();
        assert!(kv.try_lock("l", 42, LOCK_TTL).await.unwrap());
        assert!(!kv.try_lock("l", 43, LOCK_TTL).await.unwrap());
        // Wrong token leaves the lock in place.
        kv.unlock("l", 43).await.unwrap();
        assert!(!kv.try_lock("l", 44, LOCK_TTL).await.unwrap());
        kv.unlock("l", 42).await.unwrap();
        assert!(kv.try_lock("l", 44, LOCK_TTL).await.unwrap());
    }
}
