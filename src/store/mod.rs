//! Atomic sorted-set store abstraction.
//!
//! All shared rate limiting state lives behind this module. The window
//! counter only ever speaks to a store through a single atomic batch, so any
//! backend that can run the four operations below as one indivisible unit
//! can coordinate many processes on the same keys.

mod memory;
mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::{RedisProvider, RedisStore};

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors that can occur while talking to a backing store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Unexpected store reply: {0}")]
    UnexpectedReply(String),
    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),
}

/// A single operation inside an atomic batch.
///
/// Scores are nanosecond timestamps. Every operation produces exactly one
/// integer reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// Remove members scored in `[min, max_exclusive)`. Replies with the number removed.
    RemoveRangeByScore {
        key: String,
        min: i64,
        max_exclusive: i64,
    },
    /// Count members scored in `[min, max]`.
    CountRangeByScore { key: String, min: i64, max: i64 },
    /// Insert a member. Replies with the number of members newly added (0 or 1).
    AddMember {
        key: String,
        score: i64,
        member: String,
    },
    /// Set or refresh the key's time-to-live. Replies 1 if applied.
    SetExpiry { key: String, ttl_secs: u64 },
}

impl StoreOp {
    /// The key this operation targets.
    pub fn key(&self) -> &str {
        match self {
            StoreOp::RemoveRangeByScore { key, .. }
            | StoreOp::CountRangeByScore { key, .. }
            | StoreOp::AddMember { key, .. }
            | StoreOp::SetExpiry { key, .. } => key,
        }
    }
}

/// A store that executes a batch of operations as one indivisible transaction.
///
/// No other batch touching the same keys may interleave with the operations
/// of a batch. Replies come back in op order, or the whole batch fails.
#[async_trait]
pub trait AtomicStore: Send {
    async fn execute_atomic(&mut self, ops: &[StoreOp]) -> Result<Vec<i64>, StoreError>;
}

/// Hands out store handles for the duration of a single call.
///
/// A handle is exclusively owned by the caller that acquired it and is
/// released when dropped, on every exit path.
#[async_trait]
pub trait StoreProvider: Send + Sync {
    type Store: AtomicStore;

    async fn acquire(&self) -> Result<Self::Store, StoreError>;
}
