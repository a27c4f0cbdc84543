//! Token bucket (burst) limiter.
//!
//! Smooths bursty traffic: each identity owns a bucket of `bucket_size`
//! tokens, refilled continuously at `refill_per_sec`, and every admitted
//! request spends one token. Refill and consume run as a single atomic store
//! operation; a client-side read followed by a write would let two concurrent
//! callers both see the last token and both spend it.

use crate::application::guarded_store::GuardedStore;
use crate::application::metrics::Metrics;
use crate::domain::bucket::{BucketDecision, BucketParams};
use crate::domain::identity::Identity;
use std::time::Duration;

/// Expiry applied to bucket state so abandoned identities do not accumulate.
pub const DEFAULT_BUCKET_TTL: Duration = Duration::from_secs(3600);

/// Token bucket checks under one key prefix.
#[derive(Debug, Clone)]
pub struct TokenBucketLimiter {
    prefix: String,
    store: GuardedStore,
    metrics: Metrics,
    ttl: Duration,
}

impl TokenBucketLimiter {
    /// Create a limiter storing buckets under `prefix`.
    pub fn new(prefix: impl Into<String>, store: GuardedStore, metrics: Metrics) -> Self {
        Self {
            prefix: prefix.into(),
            store,
            metrics,
            ttl: DEFAULT_BUCKET_TTL,
        }
    }

    /// Override the bucket expiry.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Key prefix of this limiter.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Try to spend one token from `identity`'s bucket.
    ///
    /// # Fail-Safe Behavior
    /// If the store errors, times out, or is known to be degraded, the request
    /// is allowed and reported against a full bucket.
    pub async fn consume(&self, identity: &Identity, params: BucketParams) -> BucketDecision {
        let key = format!("{}:{}", self.prefix, identity);
        let now_ms = self.store.now_millis();
        let ttl = self.ttl;

        let result = self
            .store
            .run(move |store| async move { store.bucket_consume(&key, now_ms, params, ttl).await })
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
                tracing::debug!(prefix = %self.prefix, error = %e, "token bucket consume failed open");
                self.metrics.record_failed_open();
                BucketDecision {
                    allowed: true,
                    tokens_remaining: params.bucket_size,
                }
            }
        }
    }
}
