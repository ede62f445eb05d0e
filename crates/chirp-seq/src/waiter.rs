use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{SeqError, SeqResult};

/// Fixed-quantum pause used by every contended retry loop.
///
/// No exponential backoff: the lock TTL already bounds the worst-case tail,
/// and a fixed quantum keeps the retry budget a simple attempt count.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Waiter {
    quantum: Duration,
}

impl Waiter {
    pub(crate) fn new(quantum: Duration) -> Self {
        Self { quantum }
    }

    /// Sleep one quantum, returning early with `Cancelled` if the token fires.
    pub(crate) async fn wait(&self, cancel: &CancellationToken) -> SeqResult<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(SeqError::Cancelled),
            _ = tokio::time::sleep(self.quantum) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn wait_elapses_quantum() {
        let waiter = Waiter::new(Duration::from_millis(250));
        let cancel = CancellationToken::new();
        let before = tokio::time::Instant::now();
        waiter.wait(&cancel).await.unwrap();
        assert_eq!(before.elapsed(), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_returns_cancelled_immediately() {
        let waiter = Waiter::new(Duration::from_secs(60));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = waiter.wait(&cancel).await.unwrap_err();
        assert!(matches!(err, SeqError::Cancelled));
    }
}
