//! Per-conversation sequence allocation for chirp's messaging backend.
//!
//! Every message appended to a conversation is stamped with a strictly
//! increasing, never-reused 64-bit sequence number. This crate hands those
//! numbers out at cache speed while keeping the authoritative counters in a
//! durable store:
//!
//! - **Range cache**: each conversation holds a pre-reserved range
//!   `[CURR, LAST)` in the shared KV; the warm path advances `CURR` in a
//!   single atomic script call.
//! - **Refill protocol**: when the range runs out (or the key was evicted),
//!   the script hands one caller a lock nonce; that caller extends the
//!   counter in the durable store and publishes the new range back.
//! - **Durable tier**: compare-and-add counters, the source of truth that
//!   makes crashes and cache eviction safe (gaps, never reuse).
//!
//! ## Key Components
//!
//! - [`SeqAllocator`]: allocation, batched max-seq reads, min-seq watermarks
//! - [`SeqKv`]: shared KV seam ([`RedisSeqKv`] in production,
//!   [`MemorySeqKv`] for tests and single-process setups)
//! - [`SeqStore`]: durable counter seam ([`LmdbSeqStore`],
//!   [`MemorySeqStore`])
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chirp_seq::{LmdbSeqStore, RedisSeqKv, SeqAllocator, SeqConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> chirp_seq::SeqResult<()> {
//! let kv = Arc::new(RedisSeqKv::connect("redis://127.0.0.1/").await?);
//! let store = Arc::new(LmdbSeqStore::open("/var/lib/chirp/seq")?);
//! let alloc = SeqAllocator::new(kv, store, SeqConfig::default());
//!
//! let cancel = CancellationToken::new();
//! // Reserve ten numbers for a group conversation.
//! let first = alloc.malloc(&cancel, "g_42", 10).await?;
//! assert_eq!(alloc.get_max_seq(&cancel, "g_42").await?, first + 10);
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency
//!
//! The allocator keeps no per-conversation state in process, so any number of
//! instances on any number of hosts may allocate concurrently; ranges can
//! never overlap because every transition runs as an atomic script against
//! the shared KV and every refill is a compare-and-add on the durable store.
//! All public calls take a [`CancellationToken`](tokio_util::sync::CancellationToken)
//! and abort their retry loops promptly when it fires.

pub mod alloc;
pub mod config;
pub mod error;
pub mod keys;
pub mod kv;
pub mod metrics;
pub mod store;

mod cache;
mod waiter;

pub use alloc::SeqAllocator;
pub use config::SeqConfig;
pub use error::{ErrorKind, SeqError, SeqResult};
pub use kv::memory::MemorySeqKv;
pub use kv::redis::RedisSeqKv;
pub use kv::{MallocStep, PublishOutcome, SeqKv};
pub use metrics::{SeqMetrics, SeqMetricsSnapshot};
pub use store::lmdb::{LmdbSeqStore, LmdbStoreOptions};
pub use store::memory::MemorySeqStore;
pub use store::SeqStore;
