//! Shared-KV key construction for the sequence subsystem.
//!
//! Every key is `<prefix><conversationID>`; the prefixes are part of the
//! on-wire contract and shared with operational tooling, so they must not
//! change between releases.

/// Prefix for the per-conversation range hash (`CURR`, `LAST`, `LOCK`).
pub const SEQ_MALLOC_PREFIX: &str = "UID_SEQ_MALLOC:";

/// Prefix for the cached min-seq value.
pub const MIN_SEQ_PREFIX: &str = "MALLOC_MIN_SEQ:";

/// Prefix for the min-seq cache-aside soft lock.
pub const MIN_SEQ_LOCK_PREFIX: &str = "MALLOC_MIN_SEQ_LOCK:";

/// Key of the range hash for a conversation.
pub fn seq_malloc_key(conversation_id: &str) -> String {
    format!("{SEQ_MALLOC_PREFIX}{conversation_id}")
}

/// Key of the cached min-seq value for a conversation.
pub fn min_seq_key(conversation_id: &str) -> String {
    format!("{MIN_SEQ_PREFIX}{conversation_id}")
}

/// Key of the soft lock taken while filling the min-seq cache.
pub fn min_seq_lock_key(conversation_id: &str) -> String {
    format!("{MIN_SEQ_LOCK_PREFIX}{conversation_id}")
}

/// Whether a conversation ID names a group conversation.
///
/// Conversation IDs are `si_<a>_<b>` for 1-to-1, `g_<id>` / `sg_<id>` for
/// (super) groups, and `n_<id>` for notification channels. Groups amortize
/// more writers per key, so they get the larger refill base.
pub fn is_group_conversation(conversation_id: &str) -> bool {
    conversation_id.starts_with("g_") || conversation_id.starts_with("sg_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_formats() {
        assert_eq!(seq_malloc_key("si_a_b"), "UID_SEQ_MALLOC:si_a_b");
        assert_eq!(min_seq_key("g_42"), "MALLOC_MIN_SEQ:g_42");
        assert_eq!(min_seq_lock_key("g_42"), "MALLOC_MIN_SEQ_LOCK:g_42");
    }

    #[test]
    fn group_detection() {
        assert!(is_group_conversation("g_42"));
        assert!(is_group_conversation("sg_42"));
        assert!(!is_group_conversation("si_a_b"));
        assert!(!is_group_conversation("n_news"));
        assert!(!is_group_conversation(""));
    }
}
