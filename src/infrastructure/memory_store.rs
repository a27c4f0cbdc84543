//! In-process counting store.
//!
//! Sharded `DashMap` storage implementing the counting store port. Each
//! operation runs while holding the shard lock for its key, which makes it
//! atomic with respect to every other caller in this process.
//!
//! Suitable for single-instance deployments and tests. Counts are not shared
//! between processes; use the Redis store when running more than one instance.

use crate::application::ports::{CountingStore, StoreError};
use crate::domain::bucket::{BucketDecision, BucketParams, BucketState};
use crate::domain::window::{IncrementResult, SlidingLog, WindowDecision};
use ahash::RandomState;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Default interval between sweeps of expired keys.
pub const DEFAULT_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// A stored value with its expiry.
#[derive(Debug, Clone)]
struct Expiring<T> {
    value: T,
    expires_at_ms: u64,
}

impl<T> Expiring<T> {
    fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

/// Thread-safe in-memory counting store backed by DashMap.
///
/// Keys expire lazily: an expired entry is treated as absent the next time it
/// is touched. Keys that are never touched again are reclaimed by a sweep that
/// runs at most once per purge interval, piggybacked on regular operations.
#[derive(Debug)]
pub struct MemoryStore {
    windows: DashMap<String, Expiring<SlidingLog>, RandomState>,
    buckets: DashMap<String, Expiring<BucketState>, RandomState>,
    purge_interval_ms: u64,
    last_purge_ms: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store sweeping every [`DEFAULT_PURGE_INTERVAL`].
    pub fn new() -> Self {
        Self::with_purge_interval(DEFAULT_PURGE_INTERVAL)
    }

    /// Create an empty store sweeping expired keys every `interval`.
    pub fn with_purge_interval(interval: Duration) -> Self {
        Self {
            windows: DashMap::with_hasher(RandomState::new()),
            buckets: DashMap::with_hasher(RandomState::new()),
            purge_interval_ms: interval.as_millis().try_into().unwrap_or(u64::MAX),
            last_purge_ms: AtomicU64::new(0),
        }
    }

    /// Number of live keys, expired or not.
    pub fn len(&self) -> usize {
        self.windows.len() + self.buckets.len()
    }

    /// Check if the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty() && self.buckets.is_empty()
    }

    /// Drop every key whose expiry has passed. Returns the number removed.
    pub fn purge_expired(&self, now_ms: u64) -> usize {
        let before = self.len();
        self.windows.retain(|_, entry| !entry.is_expired(now_ms));
        self.buckets.retain(|_, entry| !entry.is_expired(now_ms));
        before.saturating_sub(self.len())
    }

    /// Sweep expired keys if the purge interval has passed since the last
    /// sweep. Must not be called while holding a map entry.
    fn maybe_purge(&self, now_ms: u64) {
        let last = self.last_purge_ms.load(Ordering::Acquire);
        if last == 0 {
            // First operation starts the clock
            let _ = self
                .last_purge_ms
                .compare_exchange(0, now_ms.max(1), Ordering::AcqRel, Ordering::Acquire);
            return;
        }
        if now_ms.saturating_sub(last) < self.purge_interval_ms {
            return;
        }
        // One caller per interval does the sweep
        if self
            .last_purge_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let removed = self.purge_expired(now_ms);
            if removed > 0 {
                tracing::debug!(removed, "purged expired rate limit keys");
            }
        }
    }

    /// Run `f` on the live window log for `key`, creating it if needed, and
    /// push its expiry to one window after `now_ms`.
    fn with_window<R>(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        f: impl FnOnce(&mut SlidingLog) -> R,
    ) -> R {
        let mut entry = self
            .windows
            .entry(key.to_owned())
            .or_insert_with(|| Expiring {
                value: SlidingLog::new(),
                expires_at_ms: now_ms.saturating_add(window_ms),
            });

        if entry.is_expired(now_ms) {
            entry.value = SlidingLog::new();
        }
        let result = f(&mut entry.value);
        entry.expires_at_ms = now_ms.saturating_add(window_ms);
        result
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CountingStore for MemoryStore {
    async fn window_increment(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> Result<IncrementResult, StoreError> {
        let result = self.with_window(key, now_ms, window_ms, |log| {
            log.increment(now_ms, window_ms)
        });
        self.maybe_purge(now_ms);
        Ok(result)
    }

    async fn window_check(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        max_requests: u64,
    ) -> Result<WindowDecision, StoreError> {
        let decision = self.with_window(key, now_ms, window_ms, |log| {
            log.check(now_ms, window_ms, max_requests)
        });
        self.maybe_purge(now_ms);
        Ok(decision)
    }

    async fn window_decrement(&self, key: &str) -> Result<(), StoreError> {
        if let Some(mut entry) = self.windows.get_mut(key) {
            entry.value.pop_newest();
        }
        Ok(())
    }

    async fn bucket_consume(
        &self,
        key: &str,
        now_ms: u64,
        params: BucketParams,
        ttl: Duration,
    ) -> Result<BucketDecision, StoreError> {
        let ttl_ms = ttl.as_millis().try_into().unwrap_or(u64::MAX);
        let decision = {
            let mut entry = self
                .buckets
                .entry(key.to_owned())
                .or_insert_with(|| Expiring {
                    value: BucketState::full(&params, now_ms),
                    expires_at_ms: now_ms.saturating_add(ttl_ms),
                });

            if entry.is_expired(now_ms) {
                entry.value = BucketState::full(&params, now_ms);
            }
            let decision = entry.value.consume(&params, now_ms);
            entry.expires_at_ms = now_ms.saturating_add(ttl_ms);
            decision
        };
        self.maybe_purge(now_ms);
        Ok(decision)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.windows.remove(key);
        self.buckets.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
