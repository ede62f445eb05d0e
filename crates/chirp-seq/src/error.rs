use std::fmt::Display;

/// Status classification surfaced to the RPC layer.
///
/// Mirrors the gRPC-style codes the message service maps call failures onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller passed a value that can never succeed (negative size, reversed range).
    InvalidArgument,
    /// The call ran out of retry budget or was cancelled while waiting.
    Timeout,
    /// The shared KV or the durable store failed underneath us.
    Backend,
    /// A protocol violation we cannot recover from (unknown script tag).
    Internal,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::InvalidArgument => write!(f, "invalid-argument"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Backend => write!(f, "backend"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

/// A specialized error type for sequence allocation.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum SeqError {
    /// Caller-supplied argument was invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The call was cancelled while waiting on contention or backends.
    #[error("operation cancelled")]
    Cancelled,
    /// Lock contention outlasted the retry budget.
    #[error("lock wait budget exhausted for conversation {conversation_id}")]
    LockTimeout { conversation_id: String },
    /// The shared KV failed.
    #[error("shared kv error: {0}")]
    Kv(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// The durable counter store failed.
    #[error("durable store error: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// A script returned a tag outside the protocol.
    #[error("unknown script state: {0}")]
    UnknownState(i64),
    /// Internal error (join failures, poisoned state).
    #[error("internal error: {0}")]
    Internal(String),
}

impl SeqError {
    /// Create an invalid-argument error from a displayable value.
    pub fn invalid_argument<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidArgument(msg.to_string())
    }

    /// Wrap a shared-KV backend failure.
    pub fn kv<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Kv(Box::new(err))
    }

    /// Wrap a durable-store backend failure.
    pub fn store<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Store(Box::new(err))
    }

    /// Create an internal error from a displayable value.
    pub fn internal<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Internal(msg.to_string())
    }

    /// Classify this error for the RPC surface.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SeqError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            SeqError::Cancelled | SeqError::LockTimeout { .. } => ErrorKind::Timeout,
            SeqError::Kv(_) | SeqError::Store(_) => ErrorKind::Backend,
            SeqError::UnknownState(_) | SeqError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// A Result type alias for sequence allocation operations.
pub type SeqResult<T> = Result<T, SeqError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_argument_helper() {
        let err = SeqError::invalid_argument("size must be non-negative");
        assert!(matches!(err, SeqError::InvalidArgument(msg) if msg.contains("non-negative")));
    }

    #[test]
    fn kind_classification() {
        assert_eq!(
            SeqError::Cancelled.kind(),
            ErrorKind::Timeout,
        );
        assert_eq!(
            SeqError::LockTimeout {
                conversation_id: "g_1".into()
            }
            .kind(),
            ErrorKind::Timeout,
        );
        assert_eq!(SeqError::UnknownState(9).kind(), ErrorKind::Internal);
        assert_eq!(
            SeqError::kv(std::io::Error::other("down")).kind(),
            ErrorKind::Backend,
        );
    }
}
