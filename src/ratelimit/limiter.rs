//! Rate limiter service built on the window counter.
//!
//! The limiter resolves named rules, namespaces store keys, borrows a store
//! handle for exactly one call, and optionally bounds that call with a
//! timeout. It is the place where callers choose between seeing store
//! errors (`check`) and the fail-open policy (`check_or_fail_open`).

use std::time::Duration;

use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, trace, warn};

use super::counter::{WindowCounter, WindowStatus};
use super::key::WindowKey;
use super::rules::{LimitRule, RuleSet};
use crate::error::{RateWindowError, Result};
use crate::store::{StoreError, StoreProvider};

/// Default namespace for store keys.
pub const DEFAULT_KEY_PREFIX: &str = "ratewindow";

/// Apply the fail-open policy to a check result.
///
/// A store error becomes [`WindowStatus::fail_open`] and is logged at warn
/// level. Any other error is passed through.
pub fn or_fail_open(result: Result<WindowStatus>) -> Result<WindowStatus> {
    match result {
        Err(RateWindowError::Store(e)) => {
            warn!(error = %e, "Store unavailable, failing open");
            Ok(WindowStatus::fail_open())
        }
        other => other,
    }
}

/// Result of checking several rules for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverallStatus {
    /// True if any individual check is over its limit
    pub exceeded: bool,
    /// Per-check statuses, in request order
    pub statuses: Vec<WindowStatus>,
}

/// A sliding-window rate limiter over a shared store.
///
/// This struct holds no counters of its own and can be shared across tasks.
pub struct RateLimiter<P: StoreProvider> {
    /// Hands out store handles per call
    provider: P,
    /// Records events and evaluates limits
    counter: WindowCounter,
    /// Named rules
    rules: RwLock<RuleSet>,
    /// Namespace for every key this limiter writes
    key_prefix: String,
    /// Upper bound on one store call, if any
    timeout: Option<Duration>,
}

impl<P: StoreProvider> RateLimiter<P> {
    /// Create a new rate limiter with no rules.
    pub fn new(provider: P) -> Self {
        Self::with_counter(provider, WindowCounter::new())
    }

    /// Create a new rate limiter around an existing counter.
    pub fn with_counter(provider: P, counter: WindowCounter) -> Self {
        Self {
            provider,
            counter,
            rules: RwLock::new(RuleSet::new()),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            timeout: None,
        }
    }

    /// Use `rules` for named checks.
    pub fn with_rules(self, rules: RuleSet) -> Self {
        *self.rules.write() = rules;
        self
    }

    /// Namespace store keys under `prefix`.
    pub fn with_key_prefix(mut self, prefix: &str) -> Self {
        self.key_prefix = prefix.to_string();
        self
    }

    /// Bound every store call by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Replace the rule set.
    pub fn set_rules(&self, rules: RuleSet) {
        let mut current = self.rules.write();
        *current = rules;
    }

    /// Get the current rule set.
    pub fn rules(&self) -> RuleSet {
        self.rules.read().clone()
    }

    /// Check `subject` against the named rule, recording one event.
    pub async fn check(&self, rule_name: &str, subject: &str) -> Result<WindowStatus> {
        let rule = self.find_rule(rule_name)?;
        let key = WindowKey::new(&self.key_prefix, &rule.name, subject)?;
        self.check_key(&key.to_store_key(), rule.window(), rule.limit)
            .await
    }

    /// Check `subject` against an ad hoc limit, recording one event.
    ///
    /// The store key has an empty rule segment, so it never shares a window
    /// with a named rule.
    pub async fn check_with(
        &self,
        subject: &str,
        window: Duration,
        limit: u64,
    ) -> Result<WindowStatus> {
        let key = WindowKey::new(&self.key_prefix, "", subject)?;
        self.check_key(&key.to_store_key(), window, limit).await
    }

    /// Check an exact store key against an ad hoc limit, recording one event.
    ///
    /// The key is used verbatim, without the prefix, so callers can share
    /// windows with other clients of the same store.
    pub async fn check_raw_key(&self, key: &str, window: Duration, limit: u64) -> Result<WindowStatus> {
        self.check_key(key, window, limit).await
    }

    /// Like [`check`](Self::check), but a store failure reports "not exceeded".
    ///
    /// The failure is logged and dropped: while the store is unreachable no
    /// subject is ever limited. Argument errors (unknown rule, empty subject)
    /// are still returned.
    pub async fn check_or_fail_open(&self, rule_name: &str, subject: &str) -> Result<WindowStatus> {
        or_fail_open(self.check(rule_name, subject).await)
    }

    /// Check several `(rule, subject)` pairs concurrently.
    ///
    /// Every pair records an event, even when another is already over limit.
    /// The first error, if any, is returned instead of a status.
    pub async fn check_all(&self, checks: &[(&str, &str)]) -> Result<OverallStatus> {
        let results = join_all(
            checks
                .iter()
                .map(|(rule, subject)| self.check(rule, subject)),
        )
        .await;

        let statuses = results.into_iter().collect::<Result<Vec<_>>>()?;
        let exceeded = statuses.iter().any(|s| s.exceeded);

        debug!(
            checks = checks.len(),
            exceeded = exceeded,
            "Checked all limits"
        );

        Ok(OverallStatus { exceeded, statuses })
    }

    fn find_rule(&self, name: &str) -> Result<LimitRule> {
        self.rules
            .read()
            .find(name)
            .cloned()
            .ok_or_else(|| RateWindowError::InvalidArgument(format!("unknown limit rule '{}'", name)))
    }

    async fn check_key(&self, store_key: &str, window: Duration, limit: u64) -> Result<WindowStatus> {
        trace!(key = %store_key, "Checking sliding window limit");

        let call = async {
            // The handle is released when this block ends, on every path
            let mut store = self.provider.acquire().await?;
            self.counter
                .check_and_record(&mut store, store_key, window, limit)
                .await
        };

        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, call)
                .await
                .map_err(|_| StoreError::Timeout(timeout))?,
            None => call.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{AtomicStore, MemoryStore, StoreOp};
    use async_trait::async_trait;
    use std::sync::Arc;

    const START: i64 = 1_700_000_000_000_000_000;

    fn test_rules() -> RuleSet {
        RuleSet::from_rules(vec![
            LimitRule::new("login", 3, Duration::from_secs(1)).unwrap(),
            LimitRule::new("search", 100, Duration::from_secs(60)).unwrap(),
        ])
        .unwrap()
    }

    fn create_limiter() -> (RateLimiter<MemoryStore>, MemoryStore, ManualClock) {
        let clock = ManualClock::new(START);
        let store = MemoryStore::with_clock(clock.clone());
        let limiter = RateLimiter::with_counter(store.clone(), WindowCounter::with_clock(clock.clone()))
            .with_rules(test_rules());
        (limiter, store, clock)
    }

    /// A provider whose store never answers.
    struct StalledProvider;

    struct StalledStore;

    #[async_trait]
    impl AtomicStore for StalledStore {
        async fn execute_atomic(&mut self, _ops: &[StoreOp]) -> std::result::Result<Vec<i64>, StoreError> {
            std::future::pending().await
        }
    }

    #[async_trait]
    impl StoreProvider for StalledProvider {
        type Store = StalledStore;

        async fn acquire(&self) -> std::result::Result<Self::Store, StoreError> {
            Ok(StalledStore)
        }
    }

    #[tokio::test]
    async fn test_named_rule_exceeds_after_limit() {
        let (limiter, _store, _clock) = create_limiter();

        for i in 1..=3 {
            let status = limiter.check("login", "client_a").await.unwrap();
            assert!(!status.exceeded, "Request {} should be within limit", i);
        }

        let status = limiter.check("login", "client_a").await.unwrap();
        assert!(status.exceeded);
        assert_eq!(status.current_count, 4);
    }

    #[tokio::test]
    async fn test_keys_are_namespaced_by_prefix_and_rule() {
        let (limiter, store, _clock) = create_limiter();
        let limiter = limiter.with_key_prefix("svc");

        limiter.check("login", "client_a").await.unwrap();
        limiter.check("search", "client_a").await.unwrap();
        limiter
            .check_with("client_a", Duration::from_secs(1), 10)
            .await
            .unwrap();

        assert!(store.contains_key("svc:login:client_a"));
        assert!(store.contains_key("svc:search:client_a"));
        assert!(store.contains_key("svc::client_a"));
    }

    #[tokio::test]
    async fn test_ad_hoc_subject_cannot_reach_named_rule_window() {
        let (limiter, store, _clock) = create_limiter();

        for _ in 0..5 {
            limiter
                .check_with("login:client_a", Duration::from_secs(60), 1000)
                .await
                .unwrap();
        }

        let status = limiter.check("login", "client_a").await.unwrap();
        assert!(!status.exceeded);
        assert_eq!(status.current_count, 1);
        assert_eq!(store.member_count("ratewindow::login:client_a"), Some(5));
        assert_eq!(store.member_count("ratewindow:login:client_a"), Some(1));
    }

    #[tokio::test]
    async fn test_raw_key_is_used_verbatim() {
        let (limiter, store, _clock) = create_limiter();
        let limiter = limiter.with_key_prefix("svc");

        for _ in 0..2 {
            limiter
                .check_raw_key("shared:quota", Duration::from_secs(1), 1)
                .await
                .unwrap();
        }
        let status = limiter
            .check_raw_key("shared:quota", Duration::from_secs(1), 1)
            .await
            .unwrap();

        assert!(status.exceeded);
        assert_eq!(status.current_count, 3);
        assert_eq!(store.member_count("shared:quota"), Some(3));
        assert_eq!(store.len(), 1);

        let result = limiter.check_raw_key("", Duration::from_secs(1), 1).await;
        assert!(matches!(result, Err(RateWindowError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_rules_do_not_share_counts() {
        let (limiter, _store, _clock) = create_limiter();

        for _ in 0..4 {
            limiter.check("login", "client_a").await.unwrap();
        }
        let search = limiter.check("search", "client_a").await.unwrap();

        assert!(!search.exceeded);
        assert_eq!(search.current_count, 1);
    }

    #[tokio::test]
    async fn test_unknown_rule_rejected() {
        let (limiter, store, _clock) = create_limiter();

        let result = limiter.check("missing", "client_a").await;

        assert!(matches!(result, Err(RateWindowError::InvalidArgument(_))));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_check_surfaces_store_errors() {
        let (limiter, store, _clock) = create_limiter();
        store.set_unavailable(true);

        let result = limiter.check("login", "client_a").await;
        assert!(matches!(result, Err(RateWindowError::Store(_))));
    }

    #[tokio::test]
    async fn test_fail_open_on_store_error() {
        let (limiter, store, _clock) = create_limiter();

        for _ in 0..5 {
            limiter.check("login", "client_a").await.unwrap();
        }
        store.set_unavailable(true);

        let status = limiter.check_or_fail_open("login", "client_a").await.unwrap();
        assert_eq!(status, WindowStatus::fail_open());

        // Argument errors are not swallowed
        let result = limiter.check_or_fail_open("missing", "client_a").await;
        assert!(matches!(result, Err(RateWindowError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_timeout_is_reported_as_store_error() {
        let limiter = RateLimiter::new(StalledProvider)
            .with_rules(test_rules())
            .with_timeout(Duration::from_millis(20));

        let result = limiter.check("login", "client_a").await;
        assert!(matches!(
            result,
            Err(RateWindowError::Store(StoreError::Timeout(_)))
        ));

        let status = limiter.check_or_fail_open("login", "client_a").await.unwrap();
        assert_eq!(status, WindowStatus::fail_open());
    }

    #[tokio::test]
    async fn test_check_all_reports_overall_exceeded() {
        let (limiter, _store, _clock) = create_limiter();

        for _ in 0..3 {
            limiter.check("login", "client_a").await.unwrap();
        }

        let overall = limiter
            .check_all(&[("search", "client_a"), ("login", "client_a")])
            .await
            .unwrap();

        assert!(overall.exceeded);
        assert_eq!(overall.statuses.len(), 2);
        assert!(!overall.statuses[0].exceeded);
        assert!(overall.statuses[1].exceeded);
    }

    #[tokio::test]
    async fn test_window_recovery_through_limiter() {
        let (limiter, _store, clock) = create_limiter();

        for _ in 0..4 {
            limiter.check("login", "client_a").await.unwrap();
        }
        clock.advance(Duration::from_secs(1));

        let status = limiter.check("login", "client_a").await.unwrap();
        assert!(!status.exceeded);
        assert_eq!(status.current_count, 1);
    }

    #[tokio::test]
    async fn test_set_rules_takes_effect() {
        let (limiter, _store, _clock) = create_limiter();

        limiter.set_rules(
            RuleSet::from_rules(vec![LimitRule::new("login", 0, Duration::from_secs(1)).unwrap()])
                .unwrap(),
        );

        assert!(limiter.check("login", "client_a").await.unwrap().exceeded);
        assert!(limiter.rules().find("search").is_none());
    }

    #[tokio::test]
    async fn test_shared_limiter_across_tasks() {
        let (limiter, _store, _clock) = create_limiter();
        let limiter = Arc::new(limiter);

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.check("search", "client_b").await.unwrap() })
            })
            .collect();

        let mut counts = Vec::new();
        for handle in handles {
            counts.push(handle.await.unwrap().current_count);
        }
        counts.sort_unstable();

        assert_eq!(counts, (1..=10).collect::<Vec<i64>>());
    }
}
