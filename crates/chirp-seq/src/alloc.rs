//! The per-conversation sequence allocator.
//!
//! Stateless in-process: every conversation's allocation state lives in the
//! shared KV as a pre-reserved range `[CURR, LAST)` refilled from the durable
//! store, and all coordination between concurrent writers (including writers
//! in other processes) happens through the KV's atomic scripts. The warm path
//! is a single KV round trip.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::cache::CacheAside;
use crate::config::SeqConfig;
use crate::error::{SeqError, SeqResult};
use crate::keys::{is_group_conversation, min_seq_key, min_seq_lock_key, seq_malloc_key};
use crate::kv::{MallocStep, PublishOutcome, SeqKv};
use crate::metrics::{SeqMetrics, SeqMetricsSnapshot};
use crate::store::SeqStore;
use crate::waiter::Waiter;

/// Allocates strictly non-reused, monotonic sequence numbers per conversation.
///
/// Cheap to share behind an `Arc`; all methods take `&self` and may be called
/// from any number of tasks concurrently.
pub struct SeqAllocator {
    kv: Arc<dyn SeqKv>,
    store: Arc<dyn SeqStore>,
    config: SeqConfig,
    metrics: Arc<SeqMetrics>,
    waiter: Waiter,
    min_seq_cache: CacheAside,
}

impl SeqAllocator {
    pub fn new(kv: Arc<dyn SeqKv>, store: Arc<dyn SeqStore>, config: SeqConfig) -> Self {
        let config = config.normalized();
        let waiter = Waiter::new(config.retry_interval());
        let min_seq_cache = CacheAside::new(
            Arc::clone(&kv),
            waiter,
            config.max_retries,
            config.lock_ttl(),
        );
        Self {
            kv,
            store,
            config,
            metrics: Arc::new(SeqMetrics::default()),
            waiter,
            min_seq_cache,
        }
    }

    /// Current counter snapshot.
    pub fn metrics(&self) -> SeqMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Refill size for a conversation: the caller's request plus a base that
    /// amortizes durable round trips. Groups fan more writers onto one key,
    /// so they get the larger base. A pure read (`size == 0`) reserves nothing.
    fn fill_size(&self, conversation_id: &str, size: i64) -> i64 {
        if size == 0 {
            return 0;
        }
        let base = if is_group_conversation(conversation_id) {
            self.config.group_fill_base
        } else {
            self.config.direct_fill_base
        };
        base + size
    }

    /// Reserve `size` consecutive sequence numbers for `conversation_id`,
    /// returning the first. The caller owns `[ret, ret + size)` exclusively.
    /// `size == 0` reads the next number without reserving anything.
    pub async fn malloc(
        &self,
        cancel: &CancellationToken,
        conversation_id: &str,
        size: i64,
    ) -> SeqResult<i64> {
        if size < 0 {
            return Err(SeqError::invalid_argument(format!(
                "allocation size must be non-negative, got {size}"
            )));
        }
        let key = seq_malloc_key(conversation_id);
        for attempt in 0..self.config.max_retries {
            let step = self
                .kv
                .malloc_step(&key, size, self.config.lock_ttl(), self.config.data_ttl())
                .await?;
            match step {
                MallocStep::Ranged { curr, .. } => {
                    self.metrics.incr_fast_path();
                    return Ok(curr);
                }
                MallocStep::MustFill { lock } => {
                    self.metrics.incr_cold_fill();
                    let fill = self.fill_size(conversation_id, size);
                    let issued = self.store.malloc(conversation_id, fill).await?;
                    self.publish_range_retry(cancel, &key, lock, issued + size, issued + fill)
                        .await;
                    return Ok(issued);
                }
                MallocStep::Locked => {
                    self.metrics.incr_contention_wait();
                    warn!(
                        key = %key,
                        size,
                        attempt = attempt + 1,
                        "range key locked by another holder, waiting"
                    );
                    self.waiter.wait(cancel).await?;
                }
                MallocStep::Exhausted { curr, last, lock } => {
                    self.metrics.incr_partial_fill();
                    let fill = self.fill_size(conversation_id, size);
                    let issued = self.store.malloc(conversation_id, fill).await?;
                    if issued == last {
                        // Contiguous: the cached prefix joins the new range.
                        self.publish_range_retry(cancel, &key, lock, curr + size, issued + fill)
                            .await;
                        return Ok(curr);
                    }
                    // Someone reserved durably without publishing (crashed
                    // holder, evicted key). The cached prefix may overlap
                    // their reservation, so it must be dropped.
                    self.metrics.incr_discarded_prefix();
                    warn!(
                        conversation_id,
                        curr, last, issued,
                        "durable counter ahead of cached range, discarding cached prefix"
                    );
                    self.publish_range_retry(cancel, &key, lock, issued + size, issued + fill)
                        .await;
                    return Ok(issued);
                }
            }
        }
        error!(
            conversation_id,
            size, "seq allocation still locked after retry budget"
        );
        Err(SeqError::LockTimeout {
            conversation_id: conversation_id.to_owned(),
        })
    }

    /// Next sequence number `malloc(…, ≥ 1)` would hand out.
    pub async fn get_max_seq(
        &self,
        cancel: &CancellationToken,
        conversation_id: &str,
    ) -> SeqResult<i64> {
        self.malloc(cancel, conversation_id, 0).await
    }

    /// Batched [`Self::get_max_seq`] over many conversations.
    ///
    /// Keys are deduplicated and grouped by KV hash slot; each group is read
    /// in one pipelined round trip and cache misses fall back to the single
    /// conversation path. Values are each individually valid at some point
    /// inside the call window; no cross-conversation consistency is implied.
    pub async fn get_max_seqs(
        &self,
        cancel: &CancellationToken,
        conversation_ids: &[String],
    ) -> SeqResult<HashMap<String, i64>> {
        match conversation_ids {
            [] => return Ok(HashMap::new()),
            [only] => return self.single_max_seq(cancel, only).await,
            _ => {}
        }
        let mut keys = Vec::with_capacity(conversation_ids.len());
        let mut key_to_conversation = HashMap::with_capacity(conversation_ids.len());
        for conversation_id in conversation_ids {
            let key = seq_malloc_key(conversation_id);
            if !key_to_conversation.contains_key(&key) {
                keys.push(key.clone());
                key_to_conversation.insert(key, conversation_id.clone());
            }
        }
        if keys.len() == 1 {
            return self.single_max_seq(cancel, &conversation_ids[0]).await;
        }
        let mut seqs = HashMap::with_capacity(key_to_conversation.len());
        for group in self.kv.group_keys_by_slot(keys) {
            self.batch_max_seqs(cancel, &group, &key_to_conversation, &mut seqs)
                .await?;
        }
        Ok(seqs)
    }

    async fn single_max_seq(
        &self,
        cancel: &CancellationToken,
        conversation_id: &str,
    ) -> SeqResult<HashMap<String, i64>> {
        let seq = self.get_max_seq(cancel, conversation_id).await?;
        Ok(HashMap::from([(conversation_id.to_owned(), seq)]))
    }

    async fn batch_max_seqs(
        &self,
        cancel: &CancellationToken,
        keys: &[String],
        key_to_conversation: &HashMap<String, String>,
        seqs: &mut HashMap<String, i64>,
    ) -> SeqResult<()> {
        let currs = self.kv.read_currs(keys).await?;
        if currs.len() != keys.len() {
            return Err(SeqError::internal(format!(
                "pipelined read returned {} values for {} keys",
                currs.len(),
                keys.len()
            )));
        }
        let mut missing = Vec::new();
        for (key, curr) in keys.iter().zip(currs) {
            let conversation_id = &key_to_conversation[key];
            match curr {
                Some(seq) => {
                    seqs.insert(conversation_id.clone(), seq);
                }
                None => missing.push(conversation_id),
            }
        }
        for conversation_id in missing {
            self.metrics.incr_batch_fallback();
            let seq = self.get_max_seq(cancel, conversation_id).await?;
            seqs.insert(conversation_id.clone(), seq);
        }
        Ok(())
    }

    /// Lowest retained sequence number, cached with a short TTL.
    pub async fn get_min_seq(
        &self,
        cancel: &CancellationToken,
        conversation_id: &str,
    ) -> SeqResult<i64> {
        let store = Arc::clone(&self.store);
        let id = conversation_id.to_owned();
        self.min_seq_cache
            .get_i64(
                cancel,
                conversation_id,
                &min_seq_key(conversation_id),
                &min_seq_lock_key(conversation_id),
                self.config.min_seq_ttl(),
                move || {
                    let store = Arc::clone(&store);
                    let id = id.clone();
                    async move { store.get_min_seq(&id).await }
                },
            )
            .await
    }

    /// Raise the retention watermark for one conversation.
    pub async fn set_min_seq(
        &self,
        cancel: &CancellationToken,
        conversation_id: &str,
        min_seq: i64,
    ) -> SeqResult<()> {
        let seqs = HashMap::from([(conversation_id.to_owned(), min_seq)]);
        self.set_min_seqs(cancel, &seqs).await
    }

    /// Raise the retention watermark for many conversations. Durable writes
    /// land first; cache entries are then deleted in slot-grouped batches so
    /// readers refill from the durable truth.
    pub async fn set_min_seqs(
        &self,
        cancel: &CancellationToken,
        seqs: &HashMap<String, i64>,
    ) -> SeqResult<()> {
        if seqs.is_empty() {
            return Ok(());
        }
        let mut keys = Vec::with_capacity(seqs.len());
        for (conversation_id, min_seq) in seqs {
            if cancel.is_cancelled() {
                return Err(SeqError::Cancelled);
            }
            self.store.set_min_seq(conversation_id, *min_seq).await?;
            keys.push(min_seq_key(conversation_id));
        }
        for group in self.kv.group_keys_by_slot(keys) {
            self.kv.del(&group).await?;
        }
        Ok(())
    }

    /// Publish a refilled range, retrying transient KV failures.
    ///
    /// Failure to publish is never surfaced: the durable reservation already
    /// stands, so the worst case is a leaked range that later callers walk
    /// past through the exhausted path.
    async fn publish_range_retry(
        &self,
        cancel: &CancellationToken,
        key: &str,
        lock: i64,
        curr: i64,
        last: i64,
    ) {
        debug_assert!(last >= curr);
        for attempt in 0..self.config.max_retries {
            match self
                .kv
                .publish_range(key, lock, self.config.data_ttl(), curr, last)
                .await
            {
                Ok(PublishOutcome::Replaced) => return,
                Ok(PublishOutcome::Created) => {
                    warn!(key, lock, curr, last, "range key expired before publish, recreated");
                    return;
                }
                Ok(PublishOutcome::LockLost) => {
                    self.metrics.incr_lock_loss();
                    warn!(
                        key,
                        lock, curr, last,
                        "refill lock taken by another holder, leaving reservation unpublished"
                    );
                    return;
                }
                Err(err @ SeqError::UnknownState(_)) => {
                    error!(key, lock, curr, last, error = %err, "publish script protocol violation");
                    return;
                }
                Err(err) => {
                    warn!(
                        key,
                        lock, curr, last,
                        attempt = attempt + 1,
                        error = %err,
                        "publishing refilled range failed"
                    );
                    if self.waiter.wait(cancel).await.is_err() {
                        return;
                    }
                }
            }
        }
        self.metrics.incr_publish_give_up();
        error!(key, lock, curr, last, "publishing refilled range still failing, giving up");
    }
}
