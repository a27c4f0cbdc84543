//! Sliding-window limiter.
//!
//! Admits at most `max_requests` per identity in any window of
//! `window_ms` ending at "now". The prune-count-insert sequence runs as one
//! atomic store operation, so concurrent callers in any number of processes
//! cannot jointly exceed the quota.

use crate::application::guarded_store::GuardedStore;
use crate::application::metrics::Metrics;
use crate::domain::identity::Identity;
use crate::domain::tier::Quota;
use crate::domain::window::WindowDecision;

/// Ad-hoc sliding-window checks under one key prefix.
#[derive(Debug, Clone)]
pub struct SlidingWindowLimiter {
    prefix: String,
    store: GuardedStore,
    metrics: Metrics,
}

impl SlidingWindowLimiter {
    /// Create a limiter storing keys under `prefix`.
    pub fn new(prefix: impl Into<String>, store: GuardedStore, metrics: Metrics) -> Self {
        Self {
            prefix: prefix.into(),
            store,
            metrics,
        }
    }

    /// Key prefix of this limiter.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The guarded store this limiter writes through.
    pub fn store(&self) -> &GuardedStore {
        &self.store
    }

    /// Check and record one request for `identity`.
    ///
    /// # Fail-Safe Behavior
    /// If the store errors, times out, or is known to be degraded, the request
    /// is allowed with `remaining = max_requests` and a reset one window from
    /// now.
    pub async fn check(
        &self,
        identity: &Identity,
        window_ms: u64,
        max_requests: u64,
    ) -> WindowDecision {
        let key = format!("{}:{}", self.prefix, identity);
        let now_ms = self.store.now_millis();

        let result = self
            .store
            .run(move |store| async move {
                store
                    .window_check(&key, now_ms, window_ms, max_requests)
                    .await
            })
            .await;

        match result {
            Ok(decision) => {
                if decision.allowed {
                    self.metrics.record_allowed();
                } else {
                    self.metrics.record_denied();
                }
                decision
            }
            Err(e) => {
                tracing::debug!(prefix = %self.prefix, error = %e, "sliding window check failed open");
                self.metrics.record_failed_open();
                WindowDecision {
                    allowed: true,
                    remaining: max_requests,
                    reset_time_ms: now_ms.saturating_add(window_ms),
                }
            }
        }
    }

    /// Check against a quota.
    pub async fn check_quota(&self, identity: &Identity, quota: Quota) -> WindowDecision {
        self.check(identity, quota.window_ms, quota.max_requests).await
    }
}

/// A sliding-window limiter bound to one quota.
#[derive(Debug, Clone)]
pub struct QuotaLimiter {
    limiter: SlidingWindowLimiter,
    quota: Quota,
}

impl QuotaLimiter {
    /// Bind a limiter to a quota.
    pub fn new(limiter: SlidingWindowLimiter, quota: Quota) -> Self {
        Self { limiter, quota }
    }

    /// The bound quota.
    pub fn quota(&self) -> Quota {
        self.quota
    }

    /// The underlying limiter.
    pub fn limiter(&self) -> &SlidingWindowLimiter {
        &self.limiter
    }

    /// Check and record one request for `identity`.
    pub async fn check(&self, identity: &Identity) -> WindowDecision {
        self.limiter.check_quota(identity, self.quota).await
    }
}
