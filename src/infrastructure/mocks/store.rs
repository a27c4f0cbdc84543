//! Counting store doubles for exercising failure handling.

use crate::application::ports::{CountingStore, StoreError};
use crate::domain::bucket::{BucketDecision, BucketParams};
use crate::domain::window::{IncrementResult, WindowDecision};
use crate::infrastructure::memory_store::MemoryStore;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn refused() -> StoreError {
    StoreError::Unavailable("connection refused".to_string())
}

/// A store whose every operation fails as if the backend were down.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnreachableStore;

impl UnreachableStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CountingStore for UnreachableStore {
    async fn window_increment(&self, _: &str, _: u64, _: u64) -> Result<IncrementResult, StoreError> {
        Err(refused())
    }

    async fn window_check(
        &self,
        _: &str,
        _: u64,
        _: u64,
        _: u64,
    ) -> Result<WindowDecision, StoreError> {
        Err(refused())
    }

    async fn window_decrement(&self, _: &str) -> Result<(), StoreError> {
        Err(refused())
    }

    async fn bucket_consume(
        &self,
        _: &str,
        _: u64,
        _: BucketParams,
        _: Duration,
    ) -> Result<BucketDecision, StoreError> {
        Err(refused())
    }

    async fn delete(&self, _: &str) -> Result<(), StoreError> {
        Err(refused())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Err(refused())
    }
}

/// A store that stalls before answering.
///
/// [`HangingStore::new`] never answers. [`HangingStore::delaying`] sleeps on
/// the tokio timer, then delegates to the wrapped store, which lets tests
/// observe writes that land after the caller gave up.
#[derive(Debug, Clone)]
pub struct HangingStore {
    inner: Option<Arc<dyn CountingStore>>,
    delay: Option<Duration>,
}

impl HangingStore {
    pub fn new() -> Self {
        Self {
            inner: None,
            delay: None,
        }
    }

    pub fn delaying(inner: Arc<dyn CountingStore>, delay: Duration) -> Self {
        Self {
            inner: Some(inner),
            delay: Some(delay),
        }
    }

    async fn stall(&self) -> &dyn CountingStore {
        match (self.delay, &self.inner) {
            (Some(delay), Some(inner)) => {
                tokio::time::sleep(delay).await;
                inner.as_ref()
            }
            _ => std::future::pending().await,
        }
    }
}

impl Default for HangingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CountingStore for HangingStore {
    async fn window_increment(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> Result<IncrementResult, StoreError> {
        self.stall().await.window_increment(key, now_ms, window_ms).await
    }

    async fn window_check(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        max_requests: u64,
    ) -> Result<WindowDecision, StoreError> {
        self.stall()
            .await
            .window_check(key, now_ms, window_ms, max_requests)
            .await
    }

    async fn window_decrement(&self, key: &str) -> Result<(), StoreError> {
        self.stall().await.window_decrement(key).await
    }

    async fn bucket_consume(
        &self,
        key: &str,
        now_ms: u64,
        params: BucketParams,
        ttl: Duration,
    ) -> Result<BucketDecision, StoreError> {
        self.stall()
            .await
            .bucket_consume(key, now_ms, params, ttl)
            .await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.stall().await.delete(key).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.stall().await.ping().await
    }
}

/// An in-memory store that can be switched off, counting every call it
/// receives either way.
#[derive(Debug)]
pub struct FlakyStore {
    inner: MemoryStore,
    available: AtomicBool,
    calls: AtomicU64,
}

impl FlakyStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            available: AtomicBool::new(true),
            calls: AtomicU64::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Operations that reached this store.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    fn enter(&self) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(refused())
        }
    }
}

#[async_trait]
impl CountingStore for FlakyStore {
    async fn window_increment(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> Result<IncrementResult, StoreError> {
        self.enter()?;
        self.inner.window_increment(key, now_ms, window_ms).await
    }

    async fn window_check(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        max_requests: u64,
    ) -> Result<WindowDecision, StoreError> {
        self.enter()?;
        self.inner
            .window_check(key, now_ms, window_ms, max_requests)
            .await
    }

    async fn window_decrement(&self, key: &str) -> Result<(), StoreError> {
        self.enter()?;
        self.inner.window_decrement(key).await
    }

    async fn bucket_consume(
        &self,
        key: &str,
        now_ms: u64,
        params: BucketParams,
        ttl: Duration,
    ) -> Result<BucketDecision, StoreError> {
        self.enter()?;
        self.inner.bucket_consume(key, now_ms, params, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.enter()?;
        self.inner.delete(key).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.enter()?;
        self.inner.ping().await
    }
}
