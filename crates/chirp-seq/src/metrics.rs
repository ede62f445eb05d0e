use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the allocator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeqMetricsSnapshot {
    pub fast_path_allocations: u64,
    pub cold_fills: u64,
    pub partial_fills: u64,
    pub discarded_prefixes: u64,
    pub contention_waits: u64,
    pub lock_losses: u64,
    pub publish_give_ups: u64,
    pub batch_fallbacks: u64,
}

/// Allocator counters.
///
/// `lock_losses` counts `setSeq` attempts rejected because another holder
/// stole the lock; the durable reservation behind such an attempt is wasted
/// but never reused, so the counter is the only visibility into that leak.
#[derive(Default)]
pub struct SeqMetrics {
    fast_path_allocations: AtomicU64,
    cold_fills: AtomicU64,
    partial_fills: AtomicU64,
    discarded_prefixes: AtomicU64,
    contention_waits: AtomicU64,
    lock_losses: AtomicU64,
    publish_give_ups: AtomicU64,
    batch_fallbacks: AtomicU64,
}

impl SeqMetrics {
    #[inline]
    pub fn incr_fast_path(&self) {
        self.fast_path_allocations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_cold_fill(&self) {
        self.cold_fills.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_partial_fill(&self) {
        self.partial_fills.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_discarded_prefix(&self) {
        self.discarded_prefixes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_contention_wait(&self) {
        self.contention_waits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_lock_loss(&self) {
        self.lock_losses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_publish_give_up(&self) {
        self.publish_give_ups.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_batch_fallback(&self) {
        self.batch_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SeqMetricsSnapshot {
        SeqMetricsSnapshot {
            fast_path_allocations: self.fast_path_allocations.load(Ordering::Relaxed),
            cold_fills: self.cold_fills.load(Ordering::Relaxed),
            partial_fills: self.partial_fills.load(Ordering::Relaxed),
            discarded_prefixes: self.discarded_prefixes.load(Ordering::Relaxed),
            contention_waits: self.contention_waits.load(Ordering::Relaxed),
            lock_losses: self.lock_losses.load(Ordering::Relaxed),
            publish_give_ups: self.publish_give_ups.load(Ordering::Relaxed),
            batch_fallbacks: self.batch_fallbacks.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let metrics = SeqMetrics::default();
        metrics.incr_fast_path();
        metrics.incr_fast_path();
        metrics.incr_lock_loss();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.fast_path_allocations, 2);
        assert_eq!(snapshot.lock_losses, 1);
        assert_eq!(snapshot.cold_fills, 0);
    }
}
