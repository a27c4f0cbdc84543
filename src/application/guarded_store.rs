//! Store access wrapped with health tracking, a timeout and detached execution.

use crate::application::health::HealthMonitor;
use crate::application::ports::{Clock, CountingStore, StoreError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Default bound on a single store round-trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(50);

/// A counting store as seen by one limiter prefix.
///
/// Each call:
/// - is skipped with [`StoreError::Degraded`] when the health monitor says so,
/// - runs on its own tokio task, so a caller that is cancelled or times out
///   does not abort the store operation half-way,
/// - is bounded by `timeout`, after which it counts as a store failure,
/// - reports its outcome to the health monitor.
#[derive(Debug, Clone)]
pub struct GuardedStore {
    store: Arc<dyn CountingStore>,
    health: Arc<HealthMonitor>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl GuardedStore {
    /// Wrap a store for one prefix.
    pub fn new(
        store: Arc<dyn CountingStore>,
        health: Arc<HealthMonitor>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            health,
            clock,
            timeout,
        }
    }

    /// Current time from the injected clock.
    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    /// The health monitor for this prefix.
    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn CountingStore> {
        &self.store
    }

    /// The clock used for timestamps.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Per-operation timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run one store operation.
    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(Arc<dyn CountingStore>) -> Fut,
        Fut: Future<Output = Result<T, StoreError>> + Send + 'static,
        T: Send + 'static,
    {
        if !self.health.should_attempt(self.clock.now_millis()) {
            return Err(StoreError::Degraded);
        }

        let task = tokio::spawn(op(Arc::clone(&self.store)));
        // Dropping the handle on timeout detaches the task rather than aborting it
        let result = match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(StoreError::Unavailable(format!(
                "store task failed: {}",
                join_error
            ))),
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        };

        let now_ms = self.clock.now_millis();
        match &result {
            Ok(_) => self.health.record_success(now_ms),
            Err(e) => self.health.record_failure(now_ms, e),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::health::{HealthConfig, HealthState};
    use crate::infrastructure::memory_store::MemoryStore;
    use crate::infrastructure::mocks::{FlakyStore, HangingStore, MockClock};

    const T0: u64 = 1_700_000_000_000;

    fn guarded(store: Arc<dyn CountingStore>, clock: Arc<MockClock>) -> GuardedStore {
        let health = Arc::new(HealthMonitor::with_config(
            "rl:test",
            HealthConfig {
                probe_interval: Duration::from_secs(5),
            },
        ));
        GuardedStore::new(store, health, clock, Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_success_marks_available() {
        let clock = Arc::new(MockClock::new(T0));
        let store = guarded(Arc::new(MemoryStore::new()), clock);

        let result = store
            .run(|s| async move { s.window_increment("rl:test:a", T0, 1_000).await })
            .await
            .unwrap();

        assert_eq!(result.total_hits, 1);
        assert_eq!(store.health().state(), HealthState::Available);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let clock = Arc::new(MockClock::new(T0));
        let store = guarded(Arc::new(HangingStore::new()), clock);

        let result = store.run(|s| async move { s.ping().await }).await;

        assert_eq!(result, Err(StoreError::Timeout(Duration::from_millis(20))));
        assert_eq!(store.health().state(), HealthState::Degraded);
    }

    #[tokio::test]
    async fn test_degraded_skips_until_probe_interval() {
        let clock = Arc::new(MockClock::new(T0));
        let flaky = Arc::new(FlakyStore::new(MemoryStore::new()));
        let store = guarded(flaky.clone(), clock.clone());

        flaky.set_available(false);
        assert!(store.run(|s| async move { s.ping().await }).await.is_err());
        assert_eq!(flaky.calls(), 1);

        flaky.set_available(true);
        let skipped = store.run(|s| async move { s.ping().await }).await;
        assert_eq!(skipped, Err(StoreError::Degraded));
        assert_eq!(flaky.calls(), 1);

        clock.advance(Duration::from_secs(5));
        assert!(store.run(|s| async move { s.ping().await }).await.is_ok());
        assert_eq!(flaky.calls(), 2);
        assert_eq!(store.health().state(), HealthState::Available);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_operation_still_completes() {
        let clock = Arc::new(MockClock::new(T0));
        let memory = Arc::new(MemoryStore::new());
        let slow = Arc::new(HangingStore::delaying(memory.clone(), Duration::from_millis(100)));
        let store = guarded(slow, clock);

        let result = store
            .run(|s| async move { s.window_increment("rl:test:slow", T0, 60_000).await })
            .await;
        assert!(matches!(result, Err(StoreError::Timeout(_))));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let after = memory.window_increment("rl:test:slow", T0, 60_000).await.unwrap();
        assert_eq!(after.total_hits, 2);
    }
}
