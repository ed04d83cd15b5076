//! Redis-backed atomic store.
//!
//! A batch becomes one `MULTI ... EXEC` pipeline, so Redis applies the whole
//! purge/count/insert/expire sequence for a key without interleaving any
//! other client's commands.

use async_trait::async_trait;
use redis::aio::{ConnectionLike, MultiplexedConnection};
use tracing::{debug, info};

use super::{AtomicStore, StoreError, StoreOp, StoreProvider};

/// An [`AtomicStore`] over any async Redis connection.
pub struct RedisStore<C> {
    conn: C,
}

impl<C> RedisStore<C> {
    pub fn new(conn: C) -> Self {
        Self { conn }
    }
}

/// Encode a batch as a transactional pipeline.
///
/// Scores travel as integer strings so nanosecond timestamps keep their
/// full precision on the wire. Redis still stores them as doubles, which
/// near the current epoch are 256 ns apart. The exclusive purge bound is sent
/// as the inclusive bound `max_exclusive - 1`: it rounds to the same double as
/// a stored score equal to it, so an event exactly at the edge is purged as
/// it is by [`MemoryStore`](super::MemoryStore). An exclusive `(` bound would
/// round up onto that score and keep it.
pub(crate) fn build_pipeline(ops: &[StoreOp]) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic();

    for op in ops {
        match op {
            StoreOp::RemoveRangeByScore {
                key,
                min,
                max_exclusive,
            } => {
                pipe.cmd("ZREMRANGEBYSCORE")
                    .arg(key)
                    .arg(min.to_string())
                    .arg(max_exclusive.saturating_sub(1).to_string());
            }
            StoreOp::CountRangeByScore { key, min, max } => {
                pipe.cmd("ZCOUNT")
                    .arg(key)
                    .arg(min.to_string())
                    .arg(max.to_string());
            }
            StoreOp::AddMember { key, score, member } => {
                pipe.cmd("ZADD").arg(key).arg(score.to_string()).arg(member);
            }
            StoreOp::SetExpiry { key, ttl_secs } => {
                pipe.cmd("EXPIRE").arg(key).arg(*ttl_secs);
            }
        }
    }

    pipe
}

#[async_trait]
impl<C: ConnectionLike + Send> AtomicStore for RedisStore<C> {
    async fn execute_atomic(&mut self, ops: &[StoreOp]) -> Result<Vec<i64>, StoreError> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }

        let pipe = build_pipeline(ops);
        let replies: Vec<i64> = pipe.query_async(&mut self.conn).await?;

        // An aborted EXEC comes back as nil, which decodes to an empty list
        if replies.len() != ops.len() {
            return Err(StoreError::UnexpectedReply(format!(
                "expected {} replies, got {}",
                ops.len(),
                replies.len()
            )));
        }

        Ok(replies)
    }
}

/// Shares one multiplexed Redis connection between callers.
///
/// Each [`acquire`](StoreProvider::acquire) hands out a cheap clone of the
/// connection that is dropped when the call finishes.
#[derive(Clone)]
pub struct RedisProvider {
    conn: MultiplexedConnection,
}

impl RedisProvider {
    /// Connect to the Redis server at `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!("Connected to Redis");
        Ok(Self { conn })
    }

}

#[async_trait]
impl StoreProvider for RedisProvider {
    type Store = RedisStore<MultiplexedConnection>;

    async fn acquire(&self) -> Result<Self::Store, StoreError> {
        debug!("Acquiring Redis store handle");
        Ok(RedisStore::new(self.conn.clone()))
    }
}
