//! Per-request rate limit guard.
//!
//! The single entry point a request pipeline calls. It resolves the caller
//! identity, applies the skip list and the optional burst bucket, then checks
//! the quota of the route's tier (or of the caller's subscription), and turns
//! the decision into a typed outcome with standard rate limit headers.
//!
//! The guard never returns a store error. When the store cannot be consulted
//! every check fails open.

use crate::application::guarded_store::GuardedStore;
use crate::application::health::{HealthConfig, HealthMonitor, HealthState};
use crate::application::metrics::Metrics;
use crate::application::ports::{Clock, CountingStore, StoreError};
use crate::application::selector::TierSelector;
use crate::application::sliding_window::SlidingWindowLimiter;
use crate::application::store_adapter::WindowStoreAdapter;
use crate::application::token_bucket::TokenBucketLimiter;
use crate::config::{ConfigError, SkipList, ThrottleConfig};
use crate::domain::bucket::BucketParams;
use crate::domain::identity::{Identity, IdentityResolver, RequestContext};
use crate::domain::subscription::SubscriptionTier;
use crate::domain::tier::UnknownTierError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

const BURST_MESSAGE: &str = "Too many requests in a short period, please slow down.";

/// How a route is limited.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Route {
    /// A named fixed tier
    Tier(String),
    /// The quota of the caller's subscription tier
    Subscription,
}

impl Route {
    /// Route limited by the named tier.
    pub fn tier(name: impl Into<String>) -> Self {
        Route::Tier(name.into())
    }
}

/// Standard rate limit response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitHeaders {
    /// Ceiling of the limit that applied
    pub limit: u64,
    /// Requests left in the current window
    pub remaining: u64,
    /// Epoch seconds at which the window frees a slot
    pub reset_epoch_secs: u64,
    /// Seconds to wait before retrying, set on denials
    pub retry_after_secs: Option<u64>,
}

impl RateLimitHeaders {
    fn new(limit: u64, remaining: u64, reset_ms: u64) -> Self {
        Self {
            limit,
            remaining,
            reset_epoch_secs: reset_ms.div_ceil(1000),
            retry_after_secs: None,
        }
    }

    fn denied(mut self, retry_after_secs: u64) -> Self {
        self.retry_after_secs = Some(retry_after_secs);
        self
    }

    /// Header name/value pairs, ready to copy onto a response.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("RateLimit-Limit", self.limit.to_string()),
            ("RateLimit-Remaining", self.remaining.to_string()),
            ("RateLimit-Reset", self.reset_epoch_secs.to_string()),
        ];
        if let Some(retry) = self.retry_after_secs {
            pairs.push(("Retry-After", retry.to_string()));
        }
        pairs
    }
}

/// Result of guarding one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitOutcome {
    /// Let the request through. Skipped requests carry no headers.
    Allowed { headers: Option<RateLimitHeaders> },
    /// Reject the request with a "too many requests" response.
    Denied {
        /// Name of the limit that was exceeded (tier, `burst`, or `sub:<tier>`)
        limit_name: String,
        /// Seconds until a retry can succeed, at least 1
        retry_after_secs: u64,
        /// Caller-facing message
        message: String,
        /// Headers for the 429 response, `Retry-After` included
        headers: RateLimitHeaders,
    },
}

impl RateLimitOutcome {
    /// Check if the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitOutcome::Allowed { .. })
    }

    /// Check if the request was rejected.
    pub fn is_denied(&self) -> bool {
        !self.is_allowed()
    }

    /// Headers to attach to the response, if any.
    pub fn headers(&self) -> Option<&RateLimitHeaders> {
        match self {
            RateLimitOutcome::Allowed { headers } => headers.as_ref(),
            RateLimitOutcome::Denied { headers, .. } => Some(headers),
        }
    }
}

/// Failure of an administrative reset.
#[derive(Debug, Error)]
pub enum ResetError {
    #[error(transparent)]
    UnknownTier(#[from] UnknownTierError),
    #[error("reset failed: {0}")]
    Store(#[from] StoreError),
}

/// Rate limit guard built from a [`ThrottleConfig`].
#[derive(Debug)]
pub struct RateLimitGuard {
    resolver: IdentityResolver,
    skip: SkipList,
    tiers: HashMap<String, WindowStoreAdapter>,
    selector: TierSelector,
    burst: Option<(TokenBucketLimiter, BucketParams)>,
    metrics: Metrics,
    burst_metrics: Metrics,
    monitors: Vec<Arc<HealthMonitor>>,
    store: Arc<dyn CountingStore>,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
}

impl RateLimitGuard {
    /// Validate `config` and build the guard over `store`.
    ///
    /// Every key prefix gets its own health monitor.
    ///
    /// # Errors
    /// Returns `ConfigError` if the configuration is invalid.
    pub fn new(
        config: &ThrottleConfig,
        store: Arc<dyn CountingStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let health_config = HealthConfig {
            probe_interval: config.probe_interval(),
        };
        let store_timeout = config.store_timeout();
        let mut monitors = Vec::new();
        let mut guarded = |prefix: &str| {
            let monitor = Arc::new(HealthMonitor::with_config(prefix, health_config.clone()));
            monitors.push(Arc::clone(&monitor));
            GuardedStore::new(Arc::clone(&store), monitor, Arc::clone(&clock), store_timeout)
        };

        let mut tiers = HashMap::new();
        for tier in config.tier_registry()?.iter() {
            let prefix = format!("{}{}", config.key_prefix, tier.name);
            let adapter = WindowStoreAdapter::new(prefix.clone(), tier.clone(), guarded(&prefix));
            tiers.insert(tier.name.clone(), adapter);
        }

        let metrics = Metrics::new();
        let selector = TierSelector::new(config.subscriptions, |tier| {
            let prefix = format!("{}sub:{}", config.key_prefix, tier);
            SlidingWindowLimiter::new(prefix.clone(), guarded(&prefix), metrics.clone())
        });

        let burst_metrics = Metrics::new();
        let burst = config.burst.map(|params| {
            let prefix = format!("{}burst", config.key_prefix);
            let limiter =
                TokenBucketLimiter::new(prefix.clone(), guarded(&prefix), burst_metrics.clone())
                    .with_ttl(config.bucket_ttl());
            (limiter, params)
        });

        let resolver = match &config.trusted_forwarded_header {
            Some(header) => IdentityResolver::new().with_trusted_forwarded_header(header),
            None => IdentityResolver::new(),
        };

        Ok(Self {
            resolver,
            skip: config.skip.clone(),
            tiers,
            selector,
            burst,
            metrics,
            burst_metrics,
            monitors,
            store,
            clock,
            store_timeout,
        })
    }

    /// Decide whether a request may proceed.
    ///
    /// # Errors
    /// Returns `UnknownTierError` if `route` names a tier that is not
    /// configured. This is a wiring defect; check route tables at startup
    /// with [`RateLimitGuard::validate_routes`].
    pub async fn check(
        &self,
        ctx: &RequestContext,
        route: &Route,
    ) -> Result<RateLimitOutcome, UnknownTierError> {
        if self.skip.matches(ctx) {
            self.metrics.record_skipped();
            return Ok(RateLimitOutcome::Allowed { headers: None });
        }

        // Resolve the route before touching the store so a wiring defect
        // never spends burst tokens.
        let adapter = match route {
            Route::Tier(name) => Some(self.adapter(name)?),
            Route::Subscription => None,
        };

        let identity = self.resolver.resolve(ctx);
        if let Some(denied) = self.check_burst(&identity).await {
            self.metrics.record_denied();
            return Ok(denied);
        }

        Ok(match adapter {
            Some(adapter) => self.check_tier(adapter, &identity).await,
            None => self.check_subscription(ctx, &identity).await,
        })
    }

    async fn check_burst(&self, identity: &Identity) -> Option<RateLimitOutcome> {
        let (limiter, params) = self.burst.as_ref()?;
        let decision = limiter.consume(identity, *params).await;
        if decision.allowed {
            return None;
        }

        let retry_after_secs = params.seconds_until_token(decision.tokens_remaining);
        let reset_ms = self
            .clock
            .now_millis()
            .saturating_add(retry_after_secs.saturating_mul(1000));
        Some(RateLimitOutcome::Denied {
            limit_name: "burst".to_string(),
            retry_after_secs,
            message: BURST_MESSAGE.to_string(),
            headers: RateLimitHeaders::new(params.bucket_size as u64, 0, reset_ms)
                .denied(retry_after_secs),
        })
    }

    async fn check_tier(&self, adapter: &WindowStoreAdapter, identity: &Identity) -> RateLimitOutcome {
        let tier = adapter.tier();
        let result = adapter.increment(identity).await;

        if result.total_hits == 0 {
            self.metrics.record_failed_open();
            return RateLimitOutcome::Allowed {
                headers: Some(RateLimitHeaders::new(
                    tier.max_requests,
                    tier.max_requests,
                    result.reset_time_ms,
                )),
            };
        }

        if result.total_hits <= tier.max_requests {
            self.metrics.record_allowed();
            return RateLimitOutcome::Allowed {
                headers: Some(RateLimitHeaders::new(
                    tier.max_requests,
                    tier.max_requests - result.total_hits,
                    result.reset_time_ms,
                )),
            };
        }

        // A denied hit must not occupy the window
        adapter.decrement(identity).await;

        self.metrics.record_denied();
        let retry_after_secs = self.retry_after(result.reset_time_ms);
        RateLimitOutcome::Denied {
            limit_name: tier.name.clone(),
            retry_after_secs,
            message: tier.message.clone(),
            headers: RateLimitHeaders::new(tier.max_requests, 0, result.reset_time_ms)
                .denied(retry_after_secs),
        }
    }

    async fn check_subscription(&self, ctx: &RequestContext, identity: &Identity) -> RateLimitOutcome {
        let tier = SubscriptionTier::from_metadata(ctx.subscription_tier.as_deref());
        let limiter = self.selector.limiter(tier);
        let quota = limiter.quota();
        let decision = limiter.check(identity).await;
        let headers = RateLimitHeaders::new(quota.max_requests, decision.remaining, decision.reset_time_ms);

        if decision.allowed {
            return RateLimitOutcome::Allowed {
                headers: Some(headers),
            };
        }

        let retry_after_secs = self.retry_after(decision.reset_time_ms);
        RateLimitOutcome::Denied {
            limit_name: format!("sub:{}", tier),
            retry_after_secs,
            message: format!(
                "Request quota of the {} plan exceeded, please try again later.",
                tier
            ),
            headers: headers.denied(retry_after_secs),
        }
    }

    fn retry_after(&self, reset_ms: u64) -> u64 {
        reset_ms
            .saturating_sub(self.clock.now_millis())
            .div_ceil(1000)
            .max(1)
    }

    fn adapter(&self, tier: &str) -> Result<&WindowStoreAdapter, UnknownTierError> {
        self.tiers
            .get(tier)
            .ok_or_else(|| UnknownTierError(tier.to_string()))
    }

    /// Fail fast if any tier-routed endpoint names an unconfigured tier.
    pub fn validate_routes<'a>(
        &self,
        routes: impl IntoIterator<Item = &'a Route>,
    ) -> Result<(), UnknownTierError> {
        for route in routes {
            if let Route::Tier(name) = route {
                self.adapter(name)?;
            }
        }
        Ok(())
    }

    /// Un-count the most recent request of a caller against a tier, e.g.
    /// when the handler decides the request should not count.
    pub async fn rollback(&self, tier: &str, ctx: &RequestContext) -> Result<(), UnknownTierError> {
        let adapter = self.adapter(tier)?;
        adapter.decrement(&self.resolver.resolve(ctx)).await;
        Ok(())
    }

    /// Administrative reset of one caller's counts in a tier.
    pub async fn reset(&self, tier: &str, identity: &Identity) -> Result<(), ResetError> {
        self.adapter(tier)?.reset_key(identity).await?;
        Ok(())
    }

    /// Resolve the identity a request would be counted under.
    pub fn identify(&self, ctx: &RequestContext) -> Identity {
        self.resolver.resolve(ctx)
    }

    /// Per-request decision counters.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Burst bucket decision counters, counted separately from requests.
    pub fn burst_metrics(&self) -> &Metrics {
        &self.burst_metrics
    }

    /// Health monitors, one per key prefix.
    pub fn health_monitors(&self) -> &[Arc<HealthMonitor>] {
        &self.monitors
    }

    /// Check if every prefix that has been observed is reachable.
    pub fn is_store_healthy(&self) -> bool {
        self.monitors
            .iter()
            .all(|monitor| monitor.state() != HealthState::Degraded)
    }

    /// Start one background prober per key prefix.
    ///
    /// Must be called from within a tokio runtime. Abort the handles to stop
    /// probing.
    pub fn spawn_probers(&self) -> Vec<JoinHandle<()>> {
        self.monitors
            .iter()
            .map(|monitor| {
                monitor.spawn_prober(
                    Arc::clone(&self.store),
                    Arc::clone(&self.clock),
                    self.store_timeout,
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::tier::{Quota, TierConfig};
    use crate::application::selector::SubscriptionQuotas;
    use crate::infrastructure::memory_store::MemoryStore;
    use crate::infrastructure::mocks::{MockClock, UnreachableStore};
    use std::net::{IpAddr, Ipv4Addr};

    const T0: u64 = 1_700_000_000_000;

    fn config() -> ThrottleConfig {
        ThrottleConfig::builder()
            .with_store_timeout(Duration::from_millis(500))
            .build()
            .unwrap()
    }

    fn guard(config: &ThrottleConfig, store: Arc<dyn CountingStore>) -> (RateLimitGuard, Arc<MockClock>) {
        let clock = Arc::new(MockClock::new(T0));
        (RateLimitGuard::new(config, store, clock.clone()).unwrap(), clock)
    }

    fn login(user: &str) -> RequestContext {
        RequestContext::new("/login").with_principal(user)
    }

    #[tokio::test]
    async fn test_auth_tier_headers_and_denial() {
        let (guard, clock) = guard(&config(), Arc::new(MemoryStore::new()));
        let auth = Route::tier("auth");

        for expected in (0..5).rev() {
            let outcome = guard.check(&login("42"), &auth).await.unwrap();
            let headers = outcome.headers().unwrap();
            assert!(outcome.is_allowed());
            assert_eq!(headers.limit, 5);
            assert_eq!(headers.remaining, expected);
            assert_eq!(headers.reset_epoch_secs, (T0 + 900_000) / 1000);
        }

        clock.advance(Duration::from_millis(100));
        match guard.check(&login("42"), &auth).await.unwrap() {
            RateLimitOutcome::Denied {
                limit_name,
                retry_after_secs,
                message,
                headers,
            } => {
                assert_eq!(limit_name, "auth");
                assert_eq!(retry_after_secs, 900);
                assert!(message.contains("authentication"));
                assert!(!message.contains("rl:"));
                assert_eq!(headers.remaining, 0);
                assert!(headers
                    .to_pairs()
                    .contains(&("Retry-After", "900".to_string())));
            }
            other => panic!("expected denial, got {:?}", other),
        }

        assert_eq!(guard.metrics().requests_allowed(), 5);
        assert_eq!(guard.metrics().requests_denied(), 1);
    }

    #[tokio::test]
    async fn test_unknown_tier_is_error() {
        let (guard, _) = guard(&config(), Arc::new(MemoryStore::new()));

        let err = guard
            .check(&login("1"), &Route::tier("billing"))
            .await
            .unwrap_err();
        assert_eq!(err, UnknownTierError("billing".to_string()));
        assert!(guard
            .validate_routes(&[Route::tier("auth"), Route::Subscription])
            .is_ok());
        assert!(guard.validate_routes(&[Route::tier("billing")]).is_err());
    }

    #[tokio::test]
    async fn test_skip_list_bypasses_store() {
        let config = ThrottleConfig::builder()
            .with_tier(TierConfig::new("auth", Duration::from_secs(60), 1, "no").unwrap())
            .skip_path("/health")
            .build()
            .unwrap();
        let store = Arc::new(MemoryStore::new());
        let (guard, _) = guard(&config, store.clone());

        for _ in 0..3 {
            let outcome = guard
                .check(&RequestContext::new("/health"), &Route::tier("auth"))
                .await
                .unwrap();
            assert_eq!(outcome, RateLimitOutcome::Allowed { headers: None });
        }
        assert!(store.is_empty());
        assert_eq!(guard.metrics().requests_skipped(), 3);
    }

    #[tokio::test]
    async fn test_burst_checked_before_window() {
        let config = ThrottleConfig::builder()
            .with_store_timeout(Duration::from_millis(500))
            .with_burst(BucketParams::new(2.0, 0.5).unwrap())
            .build()
            .unwrap();
        let (guard, clock) = guard(&config, Arc::new(MemoryStore::new()));
        let general = Route::tier("general");

        assert!(guard.check(&login("7"), &general).await.unwrap().is_allowed());
        assert!(guard.check(&login("7"), &general).await.unwrap().is_allowed());

        match guard.check(&login("7"), &general).await.unwrap() {
            RateLimitOutcome::Denied {
                limit_name,
                retry_after_secs,
                ..
            } => {
                assert_eq!(limit_name, "burst");
                assert_eq!(retry_after_secs, 2);
            }
            other => panic!("expected burst denial, got {:?}", other),
        }

        // The burst denial did not count against the window
        clock.advance(Duration::from_secs(2));
        let outcome = guard.check(&login("7"), &general).await.unwrap();
        assert_eq!(outcome.headers().unwrap().remaining, 97);
    }

    #[tokio::test]
    async fn test_subscription_route_uses_caller_tier() {
        let quotas = SubscriptionQuotas {
            free: Quota::new(Duration::from_secs(60), 1),
            basic: Quota::new(Duration::from_secs(60), 2),
            pro: Quota::new(Duration::from_secs(60), 3),
            enterprise: Quota::new(Duration::from_secs(60), 4),
        };
        let config = ThrottleConfig::builder()
            .with_store_timeout(Duration::from_millis(500))
            .with_subscriptions(quotas)
            .build()
            .unwrap();
        let (guard, _) = guard(&config, Arc::new(MemoryStore::new()));
        let pro = RequestContext::new("/api").with_user_id("9").with_subscription_tier("pro");

        for _ in 0..3 {
            assert!(guard.check(&pro, &Route::Subscription).await.unwrap().is_allowed());
        }
        match guard.check(&pro, &Route::Subscription).await.unwrap() {
            RateLimitOutcome::Denied {
                limit_name, headers, ..
            } => {
                assert_eq!(limit_name, "sub:pro");
                assert_eq!(headers.limit, 3);
            }
            other => panic!("expected denial, got {:?}", other),
        }

        // Unrecognised tier metadata falls back to free
        let gold = RequestContext::new("/api").with_user_id("10").with_subscription_tier("gold");
        let outcome = guard.check(&gold, &Route::Subscription).await.unwrap();
        assert_eq!(outcome.headers().unwrap().limit, 1);
    }

    #[tokio::test]
    async fn test_reset_and_rollback() {
        let config = ThrottleConfig::builder()
            .with_tier(TierConfig::new("sensitive", Duration::from_secs(3600), 2, "no").unwrap())
            .with_store_timeout(Duration::from_millis(500))
            .build()
            .unwrap();
        let (guard, _) = guard(&config, Arc::new(MemoryStore::new()));
        let route = Route::tier("sensitive");
        let ctx = RequestContext::new("/transfer")
            .with_peer_addr(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5)));

        guard.check(&ctx, &route).await.unwrap();
        guard.check(&ctx, &route).await.unwrap();
        assert!(guard.check(&ctx, &route).await.unwrap().is_denied());

        // The denial left no entry behind, so rolling back frees one slot
        guard.rollback("sensitive", &ctx).await.unwrap();
        assert!(guard.check(&ctx, &route).await.unwrap().is_allowed());
        assert!(guard.check(&ctx, &route).await.unwrap().is_denied());

        guard.reset("sensitive", &guard.identify(&ctx)).await.unwrap();
        assert!(guard.check(&ctx, &route).await.unwrap().is_allowed());

        assert!(matches!(
            guard.reset("billing", &Identity::unknown()).await,
            Err(ResetError::UnknownTier(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_open_with_headers() {
        let (guard, _) = guard(&config(), Arc::new(UnreachableStore::new()));

        for _ in 0..20 {
            let outcome = guard.check(&login("42"), &Route::tier("auth")).await.unwrap();
            let headers = outcome.headers().unwrap();
            assert!(outcome.is_allowed());
            assert_eq!(headers.remaining, 5);
        }
        assert!(!guard.is_store_healthy());
        assert!(matches!(
            guard.reset("auth", &Identity::user("42")).await,
            Err(ResetError::Store(_))
        ));
    }

    #[test]
    fn test_headers_round_up_reset() {
        let headers = RateLimitHeaders::new(10, 3, 1_700_000_000_001);
        assert_eq!(
            headers.to_pairs(),
            vec![
                ("RateLimit-Limit", "10".to_string()),
                ("RateLimit-Remaining", "3".to_string()),
                ("RateLimit-Reset", "1700000001".to_string()),
            ]
        );
    }
}
