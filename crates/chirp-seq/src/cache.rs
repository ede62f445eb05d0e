use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{SeqError, SeqResult};
use crate::kv::SeqKv;
use crate::waiter::Waiter;

/// Soft-lock cache-aside reader.
///
/// On a miss one caller takes the KV-side lock, fetches the durable value and
/// publishes it with a TTL; everyone else re-reads the cache after a quantum.
/// The lock is what collapses a thundering herd onto a single durable fetch,
/// across processes as well as within one.
pub(crate) struct CacheAside {
    kv: Arc<dyn SeqKv>,
    waiter: Waiter,
    max_retries: u32,
    lock_ttl: Duration,
}

impl CacheAside {
    pub(crate) fn new(
        kv: Arc<dyn SeqKv>,
        waiter: Waiter,
        max_retries: u32,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            kv,
            waiter,
            max_retries,
            lock_ttl,
        }
    }

    pub(crate) async fn get_i64<F, Fut>(
        &self,
        cancel: &CancellationToken,
        conversation_id: &str,
        key: &str,
        lock_key: &str,
        ttl: Duration,
        mut fill: F,
    ) -> SeqResult<i64>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SeqResult<i64>>,
    {
        for _attempt in 0..self.max_retries {
            if let Some(value) = self.kv.get_i64(key).await? {
                return Ok(value);
            }
            let token: i64 = rand::rng().random_range(0..=999_999_999);
            if self.kv.try_lock(lock_key, token, self.lock_ttl).await? {
                let value = match fill().await {
                    Ok(value) => value,
                    Err(err) => {
                        let _ = self.kv.unlock(lock_key, token).await;
                        return Err(err);
                    }
                };
                // The durable read already succeeded, so a failed cache write
                // only costs the next reader another fill.
                if let Err(err) = self.kv.set_i64(key, value, ttl).await {
                    warn!(key, error = %err, "writing cache-aside value failed");
                }
                let _ = self.kv.unlock(lock_key, token).await;
                return Ok(value);
            }
            self.waiter.wait(cancel).await?;
        }
        warn!(key, lock_key, "cache-aside fill still locked after retry budget");
        Err(SeqError::LockTimeout {
            conversation_id: conversation_id.to_owned(),
        })
    }
}
