//! In-process sorted-set store.
//!
//! Mirrors the Redis semantics the window counter relies on: one ordered set
//! per key, score-range removal and counting, member-unique inserts, and
//! key expiry. A whole batch is applied under a single lock, which gives the
//! same indivisibility as `MULTI`/`EXEC` for every handle cloned from one
//! store.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::{AtomicStore, StoreError, StoreOp, StoreProvider};
use crate::clock::{Clock, SystemClock};

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Minimum clock time between two full sweeps of expired keys.
const SWEEP_INTERVAL_NANOS: i64 = NANOS_PER_SEC;

/// Members of one key, indexed both by score order and by member value.
#[derive(Debug, Default)]
struct SortedSet {
    by_score: BTreeSet<(i64, String)>,
    scores: HashMap<String, i64>,
    /// Absolute expiry in clock nanoseconds
    expires_at: Option<i64>,
}

impl SortedSet {
    fn remove_range(&mut self, min: i64, max_exclusive: i64) -> i64 {
        if min >= max_exclusive {
            return 0;
        }
        let doomed: Vec<(i64, String)> = self
            .by_score
            .range((min, String::new())..(max_exclusive, String::new()))
            .cloned()
            .collect();
        for (score, member) in &doomed {
            self.by_score.remove(&(*score, member.clone()));
            self.scores.remove(member);
        }
        doomed.len() as i64
    }

    fn count_range(&self, min: i64, max: i64) -> i64 {
        if min > max {
            return 0;
        }
        self.by_score
            .range((min, String::new())..)
            .take_while(|(score, _)| *score <= max)
            .count() as i64
    }

    fn add(&mut self, score: i64, member: &str) -> i64 {
        match self.scores.insert(member.to_string(), score) {
            Some(old) => {
                self.by_score.remove(&(old, member.to_string()));
                self.by_score.insert((score, member.to_string()));
                0
            }
            None => {
                self.by_score.insert((score, member.to_string()));
                1
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

struct Inner {
    sets: Mutex<HashMap<String, SortedSet>>,
    clock: Arc<dyn Clock>,
    unavailable: AtomicBool,
    /// Clock time at or after which the next batch sweeps every key
    next_sweep: AtomicI64,
}

/// A shared in-memory store. Clones are handles onto the same data.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Create a store whose expiry follows the system clock.
    pub fn new() -> Self {
        Self::with_clock(SystemClock::new())
    }

    /// Create a store whose expiry follows `clock`.
    pub fn with_clock<C: Clock + 'static>(clock: C) -> Self {
        Self {
            inner: Arc::new(Inner {
                sets: Mutex::new(HashMap::new()),
                clock: Arc::new(clock),
                unavailable: AtomicBool::new(false),
                next_sweep: AtomicI64::new(i64::MIN),
            }),
        }
    }

    /// Make every subsequent batch fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of live (non-expired) keys.
    pub fn len(&self) -> usize {
        let now = self.inner.clock.now_nanos();
        let mut sets = self.inner.sets.lock();
        sweep_expired(&mut sets, now);
        sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` currently exists.
    pub fn contains_key(&self, key: &str) -> bool {
        self.member_count(key).is_some()
    }

    /// Number of members stored under `key`, if the key is live.
    pub fn member_count(&self, key: &str) -> Option<usize> {
        let now = self.inner.clock.now_nanos();
        let mut sets = self.inner.sets.lock();
        evict_if_expired(&mut sets, key, now);
        sets.get(key).map(|set| set.scores.len())
    }

    /// Remaining time-to-live of `key` in whole seconds, rounded up.
    pub fn ttl_secs(&self, key: &str) -> Option<u64> {
        let now = self.inner.clock.now_nanos();
        let mut sets = self.inner.sets.lock();
        evict_if_expired(&mut sets, key, now);
        let expires_at = sets.get(key)?.expires_at?;
        let remaining = expires_at.saturating_sub(now);
        Some(((remaining + NANOS_PER_SEC - 1) / NANOS_PER_SEC) as u64)
    }

    fn apply(sets: &mut HashMap<String, SortedSet>, op: &StoreOp, now: i64) -> i64 {
        let key = op.key();
        evict_if_expired(sets, key, now);

        let reply = match op {
            StoreOp::RemoveRangeByScore {
                min, max_exclusive, ..
            } => sets
                .get_mut(key)
                .map_or(0, |set| set.remove_range(*min, *max_exclusive)),
            StoreOp::CountRangeByScore { min, max, .. } => {
                sets.get(key).map_or(0, |set| set.count_range(*min, *max))
            }
            StoreOp::AddMember { score, member, .. } => sets
                .entry(key.to_string())
                .or_default()
                .add(*score, member),
            StoreOp::SetExpiry { ttl_secs, .. } => {
                if *ttl_secs == 0 {
                    // Redis deletes a key given a zero expiry
                    sets.remove(key).map_or(0, |_| 1)
                } else if let Some(set) = sets.get_mut(key) {
                    let ttl = i64::try_from(*ttl_secs)
                        .unwrap_or(i64::MAX)
                        .saturating_mul(NANOS_PER_SEC);
                    set.expires_at = Some(now.saturating_add(ttl));
                    1
                } else {
                    0
                }
            }
        };

        // Empty sorted sets do not exist
        if sets.get(key).is_some_and(SortedSet::is_empty) {
            sets.remove(key);
        }

        reply
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn is_expired(set: &SortedSet, now: i64) -> bool {
    set.expires_at.is_some_and(|at| at <= now)
}

/// Drop every expired key. Keys that are never touched again would otherwise
/// stay resident for the life of the process.
fn sweep_expired(sets: &mut HashMap<String, SortedSet>, now: i64) {
    let before = sets.len();
    sets.retain(|_, set| !is_expired(set, now));
    let evicted = before - sets.len();
    if evicted > 0 {
        trace!(evicted = evicted, remaining = sets.len(), "Swept expired keys");
    }
}

fn evict_if_expired(sets: &mut HashMap<String, SortedSet>, key: &str, now: i64) {
    if sets.get(key).is_some_and(|set| is_expired(set, now)) {
        trace!(key = %key, "Evicting expired key");
        sets.remove(key);
    }
}

#[async_trait]
impl AtomicStore for MemoryStore {
    async fn execute_atomic(&mut self, ops: &[StoreOp]) -> Result<Vec<i64>, StoreError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "memory store marked unavailable".to_string(),
            ));
        }

        let now = self.inner.clock.now_nanos();
        let mut sets = self.inner.sets.lock();
        if now >= self.inner.next_sweep.load(Ordering::Relaxed) {
            sweep_expired(&mut sets, now);
            self.inner
                .next_sweep
                .store(now.saturating_add(SWEEP_INTERVAL_NANOS), Ordering::Relaxed);
        }
        Ok(ops
            .iter()
            .map(|op| Self::apply(&mut sets, op, now))
            .collect())
    }
}

#[async_trait]
impl StoreProvider for MemoryStore {
    type Store = MemoryStore;

    async fn acquire(&self) -> Result<Self::Store, StoreError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(self.clone())
    }
}
