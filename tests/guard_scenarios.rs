//! End-to-end scenarios through the public guard API.

use async_trait::async_trait;
use request_throttle::{
    BucketDecision, BucketParams, Clock, CountingStore, IncrementResult, MemoryStore,
    RateLimitGuard, RateLimitOutcome, RequestContext, Route, StoreError, ThrottleConfig,
    TierConfig, WindowDecision,
};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const T0: u64 = 1_700_000_000_000;

/// Clock advanced by hand.
#[derive(Debug)]
struct ManualClock(AtomicU64);

impl ManualClock {
    fn new() -> Arc<Self> {
        Arc::new(Self(AtomicU64::new(T0)))
    }

    fn advance(&self, by: Duration) {
        self.0.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Store whose every operation fails.
#[derive(Debug)]
struct DownStore;

fn down() -> StoreError {
    StoreError::Unavailable("connection refused".to_string())
}

#[async_trait]
impl CountingStore for DownStore {
    async fn window_increment(&self, _: &str, _: u64, _: u64) -> Result<IncrementResult, StoreError> {
        Err(down())
    }

    async fn window_check(&self, _: &str, _: u64, _: u64, _: u64) -> Result<WindowDecision, StoreError> {
        Err(down())
    }

    async fn window_decrement(&self, _: &str) -> Result<(), StoreError> {
        Err(down())
    }

    async fn bucket_consume(
        &self,
        _: &str,
        _: u64,
        _: BucketParams,
        _: Duration,
    ) -> Result<BucketDecision, StoreError> {
        Err(down())
    }

    async fn delete(&self, _: &str) -> Result<(), StoreError> {
        Err(down())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Err(down())
    }
}

fn base_config() -> request_throttle::ThrottleConfigBuilder {
    ThrottleConfig::builder().with_store_timeout(Duration::from_millis(500))
}

#[tokio::test]
async fn test_auth_tier_scenario() {
    let clock = ManualClock::new();
    let config = base_config().build().unwrap();
    let guard = RateLimitGuard::new(&config, Arc::new(MemoryStore::new()), clock.clone()).unwrap();
    let ctx = RequestContext::new("/login").with_principal("42");
    let auth = Route::tier("auth");

    let mut remaining = Vec::new();
    for _ in 0..5 {
        let outcome = guard.check(&ctx, &auth).await.unwrap();
        assert!(outcome.is_allowed());
        remaining.push(outcome.headers().unwrap().remaining);
    }
    assert_eq!(remaining, vec![4, 3, 2, 1, 0]);

    clock.advance(Duration::from_millis(100));
    let denied = guard.check(&ctx, &auth).await.unwrap();
    let headers = denied.headers().unwrap();
    assert!(denied.is_denied());
    assert_eq!(headers.reset_epoch_secs, (T0 + 900_000) / 1000);
    assert_eq!(headers.retry_after_secs, Some(900));
}

#[tokio::test]
async fn test_window_recovers_after_full_window() {
    let clock = ManualClock::new();
    let config = base_config()
        .with_tier(TierConfig::new("general", Duration::from_secs(1), 3, "slow down").unwrap())
        .build()
        .unwrap();
    let guard = RateLimitGuard::new(&config, Arc::new(MemoryStore::new()), clock.clone()).unwrap();
    let ctx = RequestContext::new("/api").with_peer_addr(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7)));
    let general = Route::tier("general");

    for _ in 0..3 {
        assert!(guard.check(&ctx, &general).await.unwrap().is_allowed());
    }
    assert!(guard.check(&ctx, &general).await.unwrap().is_denied());

    clock.advance(Duration::from_secs(1));
    assert!(guard.check(&ctx, &general).await.unwrap().is_allowed());
}

#[tokio::test]
async fn test_retries_while_denied_do_not_extend_window() {
    let clock = ManualClock::new();
    let config = base_config().build().unwrap();
    let store = Arc::new(MemoryStore::new());
    let guard = RateLimitGuard::new(&config, store, clock.clone()).unwrap();
    let ctx = RequestContext::new("/login").with_principal("42");
    let auth = Route::tier("auth");

    for _ in 0..5 {
        assert!(guard.check(&ctx, &auth).await.unwrap().is_allowed());
    }

    // One retry per minute for five minutes, each pointing at the same reset
    for minute in 1..=5u64 {
        clock.advance(Duration::from_secs(60));
        let denied = guard.check(&ctx, &auth).await.unwrap();
        let headers = denied.headers().unwrap();
        assert!(denied.is_denied());
        assert_eq!(headers.reset_epoch_secs, (T0 + 900_000) / 1000);
        assert_eq!(headers.retry_after_secs, Some(900 - minute * 60));
    }

    clock.advance(Duration::from_secs(600));
    let outcome = guard.check(&ctx, &auth).await.unwrap();
    assert!(outcome.is_allowed());
    assert_eq!(outcome.headers().unwrap().remaining, 4);
    assert_eq!(guard.metrics().requests_denied(), 5);
}

#[tokio::test]
async fn test_burst_bucket_scenario() {
    let clock = ManualClock::new();
    let config = base_config()
        .with_burst(BucketParams::new(10.0, 1.0).unwrap())
        .build()
        .unwrap();
    let guard = RateLimitGuard::new(&config, Arc::new(MemoryStore::new()), clock.clone()).unwrap();
    let ctx = RequestContext::new("/api").with_user_id("42");
    let general = Route::tier("general");

    for _ in 0..10 {
        assert!(guard.check(&ctx, &general).await.unwrap().is_allowed());
    }
    assert!(guard.check(&ctx, &general).await.unwrap().is_denied());

    clock.advance(Duration::from_secs(5));
    for _ in 0..5 {
        assert!(guard.check(&ctx, &general).await.unwrap().is_allowed());
    }
    match guard.check(&ctx, &general).await.unwrap() {
        RateLimitOutcome::Denied {
            limit_name,
            retry_after_secs,
            ..
        } => {
            assert_eq!(limit_name, "burst");
            assert_eq!(retry_after_secs, 1);
        }
        other => panic!("expected burst denial, got {:?}", other),
    }
}

#[tokio::test]
async fn test_identity_is_deterministic_across_address_forms() {
    let clock = ManualClock::new();
    let config = base_config()
        .with_tier(TierConfig::new("auth", Duration::from_secs(60), 2, "no").unwrap())
        .build()
        .unwrap();
    let guard = RateLimitGuard::new(&config, Arc::new(MemoryStore::new()), clock).unwrap();
    let auth = Route::tier("auth");

    let v4 = RequestContext::new("/login").with_peer_addr(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)));
    let mapped = RequestContext::new("/login").with_peer_addr(IpAddr::V6(
        Ipv4Addr::new(192, 0, 2, 1).to_ipv6_mapped(),
    ));
    assert_eq!(guard.identify(&v4), guard.identify(&mapped));

    assert!(guard.check(&v4, &auth).await.unwrap().is_allowed());
    assert!(guard.check(&mapped, &auth).await.unwrap().is_allowed());
    assert!(guard.check(&v4, &auth).await.unwrap().is_denied());

    // A different caller has its own window
    let other = RequestContext::new("/login").with_peer_addr(IpAddr::V6(Ipv6Addr::LOCALHOST));
    assert!(guard.check(&other, &auth).await.unwrap().is_allowed());
}

#[tokio::test]
async fn test_untrusted_forwarded_header_is_ignored() {
    let clock = ManualClock::new();
    let peer = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

    let config = base_config().build().unwrap();
    let guard = RateLimitGuard::new(&config, Arc::new(MemoryStore::new()), clock.clone()).unwrap();
    let ctx = RequestContext::new("/")
        .with_peer_addr(peer)
        .with_header("X-Forwarded-For", "203.0.113.9, 10.0.0.1");
    assert_eq!(guard.identify(&ctx).as_str(), "ip:10.0.0.1");

    let trusted = base_config()
        .with_trusted_forwarded_header("x-forwarded-for")
        .build()
        .unwrap();
    let guard = RateLimitGuard::new(&trusted, Arc::new(MemoryStore::new()), clock).unwrap();
    assert_eq!(guard.identify(&ctx).as_str(), "ip:203.0.113.9");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_unreachable_store_fails_open_under_load() {
    let clock = ManualClock::new();
    let config = base_config()
        .with_tier(TierConfig::new("auth", Duration::from_secs(900), 1, "no").unwrap())
        .with_burst(BucketParams::new(1.0, 0.001).unwrap())
        .build()
        .unwrap();
    let guard = Arc::new(RateLimitGuard::new(&config, Arc::new(DownStore), clock).unwrap());

    let handles: Vec<_> = (0..1000)
        .map(|i| {
            let guard = Arc::clone(&guard);
            tokio::spawn(async move {
                let route = if i % 2 == 0 {
                    Route::tier("auth")
                } else {
                    Route::Subscription
                };
                let ctx = RequestContext::new("/login").with_principal("42");
                guard.check(&ctx, &route).await.unwrap()
            })
        })
        .collect();

    for handle in handles {
        assert!(handle.await.unwrap().is_allowed());
    }

    let snapshot = guard.metrics().snapshot();
    assert_eq!(snapshot.requests_failed_open, 1000);
    assert_eq!(snapshot.requests_denied, 0);
    assert!(!guard.is_store_healthy());
}

#[tokio::test]
async fn test_guard_from_yaml() {
    let yaml = r#"
key_prefix: "svc:"
tiers:
  - name: export
    window_ms: 60000
    max_requests: 1
    message: One export per minute.
skip:
  headers: ["x-internal-probe"]
"#;
    let config = ThrottleConfig::from_yaml(yaml).unwrap();
    let guard = RateLimitGuard::new(&config, Arc::new(MemoryStore::new()), ManualClock::new()).unwrap();
    let ctx = RequestContext::new("/export").with_user_id("5");
    let export = Route::tier("export");

    assert!(guard.validate_routes(&[Route::tier("auth")]).is_err());
    assert!(guard.check(&ctx, &export).await.unwrap().is_allowed());

    match guard.check(&ctx, &export).await.unwrap() {
        RateLimitOutcome::Denied { message, .. } => assert_eq!(message, "One export per minute."),
        other => panic!("expected denial, got {:?}", other),
    }

    let probe = ctx.clone().with_header("X-Internal-Probe", "1");
    assert_eq!(
        guard.check(&probe, &export).await.unwrap(),
        RateLimitOutcome::Allowed { headers: None }
    );
}
