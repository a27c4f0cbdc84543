//! Ports (interfaces) for the application layer.
//!
//! In hexagonal architecture, ports define the interfaces that the application
//! layer needs. Infrastructure adapters implement these ports.

use crate::domain::bucket::{BucketDecision, BucketParams};
use crate::domain::window::{IncrementResult, WindowDecision};
use async_trait::async_trait;
use std::fmt::Debug;
use std::time::Duration;
use thiserror::Error;

/// Port for obtaining current time.
///
/// Quota state is shared between processes, so time is wall-clock epoch
/// milliseconds rather than a process-local `Instant`.
/// Infrastructure provides concrete implementations (SystemClock, MockClock).
pub trait Clock: Send + Sync + Debug {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64;
}

/// Failure talking to the shared counting store.
///
/// Never surfaced to request handlers: every limiter absorbs it by failing
/// open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store could not be reached or rejected the command
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store did not answer within the configured timeout
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    /// The store answered with data this crate cannot interpret
    #[error("store returned malformed data: {0}")]
    Corrupt(String),
    /// The operation was skipped because the store is known to be degraded
    #[error("store marked degraded, operation skipped")]
    Degraded,
}

/// Port for the shared, atomic counting store.
///
/// Every method is a single atomic unit with respect to other callers on the
/// same key, in this process or any other. Implementations must not split a
/// method into a client-side read followed by a write.
#[async_trait]
pub trait CountingStore: Send + Sync + Debug {
    /// Prune entries at or before `now - window`, record `now`, return the live
    /// count and reset time.
    async fn window_increment(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> Result<IncrementResult, StoreError>;

    /// Prune, count, and record `now` only if fewer than `max_requests` entries
    /// remain. Refreshes the key expiry to `window`.
    async fn window_check(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        max_requests: u64,
    ) -> Result<WindowDecision, StoreError>;

    /// Remove the most recently recorded window entry, if any.
    async fn window_decrement(&self, key: &str) -> Result<(), StoreError>;

    /// Refill and try to take one token, persisting the bucket with `ttl`.
    async fn bucket_consume(
        &self,
        key: &str,
        now_ms: u64,
        params: BucketParams,
        ttl: Duration,
    ) -> Result<BucketDecision, StoreError>;

    /// Delete all state stored under `key`.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Cheap round-trip used by the health monitor to probe availability.
    async fn ping(&self) -> Result<(), StoreError>;
}
