//! Sliding-window event counter.
//!
//! Each key maps to a sorted set in the backing store whose scores are
//! event timestamps in nanoseconds. One call runs a single atomic batch
//! against that set:
//!
//! 1. drop every event at or before `now - window`
//! 2. count the events that survive, up to `now`
//! 3. insert an event for `now`
//! 4. refresh the key's expiry to the window length, rounded up to seconds
//!
//! The event is recorded whether or not the limit is already exceeded.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::{RateWindowError, Result};
use crate::store::{AtomicStore, StoreError, StoreOp};

/// Process-wide clock behind the free [`check_and_record`] function.
static SYSTEM_CLOCK: SystemClock = SystemClock::new();

/// Reply positions within the batch built by [`window_ops`].
const COUNT_REPLY: usize = 1;
const ADD_REPLY: usize = 2;

/// Outcome of recording one event for a key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WindowStatus {
    /// Whether the count is above the limit
    pub exceeded: bool,
    /// Events inside the trailing window, including the one just recorded.
    ///
    /// The Nth call into an empty window reports N, not the N - 1 events the
    /// store held before this one was added. The first call reports 1, and
    /// `exceeded` first becomes true on call `limit + 1`.
    pub current_count: i64,
}

impl WindowStatus {
    /// The status to act on when the store could not be reached.
    ///
    /// A store outage never blocks traffic: callers that fall back to this
    /// value stop enforcing limits until the store recovers.
    pub fn fail_open() -> Self {
        Self::default()
    }
}

/// Records events against a shared store and reports whether a key is over
/// its limit within a trailing window.
///
/// The counter holds no per-key state. All coordination between callers,
/// in this process or others, happens through the store's atomic batch.
pub struct WindowCounter {
    clock: Arc<dyn Clock>,
}

impl WindowCounter {
    /// Create a counter driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(SystemClock::new())
    }

    /// Create a counter driven by `clock`.
    pub fn with_clock<C: Clock + 'static>(clock: C) -> Self {
        Self {
            clock: Arc::new(clock),
        }
    }

    /// Record one event for `key` now and check it against `limit`.
    ///
    /// On error nothing is known about the key's count; see
    /// [`WindowStatus::fail_open`] for the value callers should fall back to.
    pub async fn check_and_record<S: AtomicStore + ?Sized>(
        &self,
        store: &mut S,
        key: &str,
        window: Duration,
        limit: u64,
    ) -> Result<WindowStatus> {
        record(store, self.clock.as_ref(), key, window, limit).await
    }
}

impl Default for WindowCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Record one event for `key` now and check it against `limit`, using the
/// process-wide system clock.
///
/// The store handle is borrowed for the duration of the call only.
pub async fn check_and_record<S: AtomicStore + ?Sized>(
    store: &mut S,
    key: &str,
    window: Duration,
    limit: u64,
) -> Result<WindowStatus> {
    record(store, &SYSTEM_CLOCK, key, window, limit).await
}

async fn record<S: AtomicStore + ?Sized>(
    store: &mut S,
    clock: &dyn Clock,
    key: &str,
    window: Duration,
    limit: u64,
) -> Result<WindowStatus> {
    if key.is_empty() {
        return Err(RateWindowError::InvalidArgument(
            "key must not be empty".to_string(),
        ));
    }
    if window.is_zero() {
        return Err(RateWindowError::InvalidArgument(
            "window must be positive".to_string(),
        ));
    }
    let window_nanos = i64::try_from(window.as_nanos()).map_err(|_| {
        RateWindowError::InvalidArgument(format!("window {:?} is too large", window))
    })?;

    let now = clock.now_nanos();
    let expired_at = now.saturating_sub(window_nanos);

    trace!(
        key = %key,
        now = now,
        window_ms = window.as_millis() as u64,
        limit = limit,
        "Recording event"
    );

    let ops = window_ops(key, now, expired_at, ttl_secs(window));
    let replies = store.execute_atomic(&ops).await?;

    let reply = |index: usize| {
        replies.get(index).copied().ok_or_else(|| {
            StoreError::UnexpectedReply(format!(
                "expected {} replies, got {}",
                ops.len(),
                replies.len()
            ))
        })
    };
    let current_count = reply(COUNT_REPLY)? + reply(ADD_REPLY)?;
    let exceeded = u64::try_from(current_count).unwrap_or(0) > limit;

    if exceeded {
        debug!(
            key = %key,
            count = current_count,
            limit = limit,
            "Sliding window limit exceeded"
        );
    }

    Ok(WindowStatus {
        exceeded,
        current_count,
    })
}

/// The atomic batch for one call.
///
/// The purge removes scores up to and including `expired_at`, so the
/// counted window is `(now - window, now]`.
fn window_ops(key: &str, now: i64, expired_at: i64, ttl_secs: u64) -> [StoreOp; 4] {
    [
        StoreOp::RemoveRangeByScore {
            key: key.to_string(),
            min: 0,
            max_exclusive: expired_at.saturating_add(1),
        },
        StoreOp::CountRangeByScore {
            key: key.to_string(),
            min: 0,
            max: now,
        },
        StoreOp::AddMember {
            key: key.to_string(),
            score: now,
            member: event_member(now),
        },
        StoreOp::SetExpiry {
            key: key.to_string(),
            ttl_secs,
        },
    ]
}

/// A set member unique to this event even when timestamps collide.
fn event_member(now: i64) -> String {
    format!("{}-{}", now, Uuid::new_v4().simple())
}

/// Key expiry for a window: whole seconds, rounded up, never zero.
fn ttl_secs(window: Duration) -> u64 {
    let secs = window.as_secs() + u64::from(window.subsec_nanos() > 0);
    secs.max(1)
}
