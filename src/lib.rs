//! # request-throttle
//!
//! Distributed request rate limiting for services that must stay up when
//! their counting store does not.
//!
//! Every inbound request is checked once against a quota keyed by the caller's
//! identity. Counts live in a shared store (Redis in production, an in-process
//! map for single instances and tests), and every read-decide-write sequence
//! runs as one atomic store operation, so any number of service instances
//! together never admit more than the quota.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use request_throttle::{
//!     MemoryStore, RateLimitGuard, RateLimitOutcome, RequestContext, Route, SystemClock,
//!     ThrottleConfig,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ThrottleConfig::builder().skip_path("/health").build()?;
//! let guard = RateLimitGuard::new(
//!     &config,
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(SystemClock::new()),
//! )?;
//!
//! // Fail fast on routes that name a missing tier
//! guard.validate_routes(&[Route::tier("auth"), Route::Subscription])?;
//!
//! let ctx = RequestContext::new("/login").with_principal("42");
//! match guard.check(&ctx, &Route::tier("auth")).await? {
//!     RateLimitOutcome::Allowed { headers } => {
//!         // copy `headers.map(|h| h.to_pairs())` onto the response
//!     }
//!     RateLimitOutcome::Denied { message, headers, .. } => {
//!         // respond 429 with `message` and `headers.to_pairs()`
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Limits
//!
//! - **Named tiers**: a sliding window of `max_requests` per `window` per
//!   identity. Defaults: `general` (100 / 15 min), `auth` (5 / 15 min),
//!   `sensitive` (3 / hour), `upload` (20 / hour).
//! - **Subscription quotas**: the caller's `free`, `basic`, `pro` or
//!   `enterprise` tier picks the window; unknown tiers fall back to `free`.
//! - **Burst bucket**: an optional token bucket checked before any window.
//!
//! ## Identity
//!
//! Requests are keyed by the authenticated principal, then a declared user id,
//! then the client address (`ip:<addr>`), then `unknown`. A forwarding header
//! is only consulted when configured as trusted.
//!
//! ## Fail-Safe Operation
//!
//! The store is never allowed to cause an outage. Every store call is bounded
//! by a timeout (50 ms by default) and any error or timeout admits the request.
//! A health monitor per key prefix logs the switch to fail-open mode once,
//! skips the store while it is degraded except for one probe per interval,
//! and logs recovery once:
//!
//! ```rust,no_run
//! # use request_throttle::{MemoryStore, RateLimitGuard, SystemClock, ThrottleConfig};
//! # use std::sync::Arc;
//! # async fn run(guard: RateLimitGuard) {
//! // Probe degraded stores in the background so enforcement resumes on idle
//! // services too
//! let probers = guard.spawn_probers();
//!
//! let snapshot = guard.metrics().snapshot();
//! println!("Denied: {:.2}%", snapshot.denial_rate() * 100.0);
//! println!("Failed open: {}", snapshot.requests_failed_open);
//! println!("Store healthy: {}", guard.is_store_healthy());
//! # }
//! ```
//!
//! ## Configuration
//!
//! [`ThrottleConfig`] loads from YAML (`ThrottleConfig::load`) or is built with
//! [`ThrottleConfig::builder`]. Either path validates every tier and bucket
//! before a guard can be created.

// Domain layer - pure business logic
pub mod domain;

// Application layer - orchestration
pub mod application;

// Infrastructure layer - external adapters
pub mod infrastructure;

pub mod config;

// Re-export commonly used types for convenience
pub use domain::{
    bucket::{BucketDecision, BucketError, BucketParams, BucketState},
    identity::{Identity, IdentityResolver, RequestContext},
    subscription::SubscriptionTier,
    tier::{Quota, TierConfig, TierError, TierRegistry, UnknownTierError},
    window::{IncrementResult, SlidingLog, WindowDecision},
};

pub use application::{
    guard::{RateLimitGuard, RateLimitHeaders, RateLimitOutcome, ResetError, Route},
    guarded_store::{GuardedStore, DEFAULT_STORE_TIMEOUT},
    health::{HealthConfig, HealthMonitor, HealthState, HealthTransition, TransitionListener},
    metrics::{Metrics, MetricsSnapshot},
    ports::{Clock, CountingStore, StoreError},
    selector::{SubscriptionQuotas, TierSelector},
    sliding_window::{QuotaLimiter, SlidingWindowLimiter},
    store_adapter::WindowStoreAdapter,
    token_bucket::{TokenBucketLimiter, DEFAULT_BUCKET_TTL},
};

pub use config::{ConfigError, SkipList, ThrottleConfig, ThrottleConfigBuilder};

pub use infrastructure::{clock::SystemClock, memory_store::MemoryStore};

#[cfg(feature = "redis-storage")]
pub use infrastructure::redis_store::RedisStore;
