use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use request_throttle::{
    BucketDecision, BucketParams, CountingStore, IdentityResolver, IncrementResult, MemoryStore,
    RateLimitGuard, RequestContext, Route, StoreError, SystemClock, ThrottleConfig, TierConfig,
    WindowDecision,
};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

/// Store that is always down, for measuring the fail-open path.
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

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn guard(store: Arc<dyn CountingStore>, burst: bool) -> RateLimitGuard {
    let mut builder = ThrottleConfig::builder().with_tier(
        TierConfig::new("general", Duration::from_secs(60), u64::MAX / 2, "slow down").unwrap(),
    );
    if burst {
        builder = builder.with_burst(BucketParams::new(1e12, 1e9).unwrap());
    }
    RateLimitGuard::new(&builder.build().unwrap(), store, Arc::new(SystemClock::new())).unwrap()
}

/// Benchmark identity derivation
fn bench_identity_resolution(c: &mut Criterion) {
    let mut group = c.benchmark_group("identity_resolution");
    let resolver = IdentityResolver::new().with_trusted_forwarded_header("x-forwarded-for");

    let principal = RequestContext::new("/api").with_principal("42");
    let forwarded = RequestContext::new("/api")
        .with_peer_addr(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))
        .with_header("x-forwarded-for", "203.0.113.9, 10.0.0.1");

    group.bench_function("principal", |b| b.iter(|| resolver.resolve(black_box(&principal))));
    group.bench_function("forwarded", |b| b.iter(|| resolver.resolve(black_box(&forwarded))));

    group.finish();
}

/// Benchmark the allow path through the in-memory store
fn bench_guard_check(c: &mut Criterion) {
    let mut group = c.benchmark_group("guard_check");
    group.throughput(Throughput::Elements(1));
    let rt = runtime();

    for burst in [false, true] {
        let guard = guard(Arc::new(MemoryStore::new()), burst);
        let route = Route::tier("general");
        let name = if burst { "window_and_burst" } else { "window" };

        group.bench_function(name, |b| {
            let mut i = 0u64;
            b.iter(|| {
                // Spread callers so no single window grows without bound
                i += 1;
                let ctx = RequestContext::new("/api").with_user_id((i % 1024).to_string());
                rt.block_on(guard.check(black_box(&ctx), &route)).unwrap()
            })
        });
    }

    group.finish();
}

/// Benchmark the fail-open path with a degraded store
fn bench_fail_open(c: &mut Criterion) {
    let mut group = c.benchmark_group("fail_open");
    let rt = runtime();
    let guard = guard(Arc::new(DownStore), false);
    let route = Route::tier("general");
    let ctx = RequestContext::new("/api").with_user_id("42");

    // First call marks the store degraded; later calls skip it
    rt.block_on(guard.check(&ctx, &route)).unwrap();

    group.bench_function("degraded_store", |b| {
        b.iter(|| rt.block_on(guard.check(black_box(&ctx), &route)).unwrap())
    });

    group.finish();
}

/// Benchmark concurrent callers contending on the in-memory store
fn bench_concurrent_callers(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_callers");
    let rt = runtime();

    for tasks in [8usize, 64] {
        let guard = Arc::new(guard(Arc::new(MemoryStore::new()), false));
        group.throughput(Throughput::Elements(tasks as u64 * 100));

        group.bench_with_input(BenchmarkId::from_parameter(tasks), &tasks, |b, &tasks| {
            b.iter(|| {
                rt.block_on(async {
                    let handles: Vec<_> = (0..tasks)
                        .map(|t| {
                            let guard = Arc::clone(&guard);
                            tokio::spawn(async move {
                                let route = Route::tier("general");
                                // Pairs of tasks share a caller to exercise key contention
                                let ctx = RequestContext::new("/api")
                                    .with_user_id((t % (tasks / 2).max(1)).to_string());
                                for _ in 0..100 {
                                    guard.check(&ctx, &route).await.unwrap();
                                }
                            })
                        })
                        .collect();
                    for handle in handles {
                        handle.await.unwrap();
                    }
                })
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_identity_resolution,
    bench_guard_check,
    bench_fail_open,
    bench_concurrent_callers
);
criterion_main!(benches);
