//! Observability metrics for rate limiting.
//!
//! Provides counters about limiter decisions for monitoring and debugging.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Metrics tracking rate limiting decisions.
///
/// All metrics use atomic operations for thread-safe updates and reads.
/// Clones share the same counters.
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    /// Requests admitted by an enforced decision
    requests_allowed: AtomicU64,
    /// Requests denied for exceeding a quota
    requests_denied: AtomicU64,
    /// Requests admitted because the store could not be consulted
    requests_failed_open: AtomicU64,
    /// Requests that bypassed limiting via the skip list
    requests_skipped: AtomicU64,
}

impl Metrics {
    /// Create a new metrics tracker.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                requests_allowed: AtomicU64::new(0),
                requests_denied: AtomicU64::new(0),
                requests_failed_open: AtomicU64::new(0),
                requests_skipped: AtomicU64::new(0),
            }),
        }
    }

    pub(crate) fn record_allowed(&self) {
        self.inner.requests_allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_denied(&self) {
        self.inner.requests_denied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed_open(&self) {
        self.inner
            .requests_failed_open
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_skipped(&self) {
        self.inner.requests_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Requests admitted by an enforced decision.
    pub fn requests_allowed(&self) -> u64 {
        self.inner.requests_allowed.load(Ordering::Relaxed)
    }

    /// Requests denied for exceeding a quota.
    pub fn requests_denied(&self) -> u64 {
        self.inner.requests_denied.load(Ordering::Relaxed)
    }

    /// Requests admitted because the store could not be consulted.
    pub fn requests_failed_open(&self) -> u64 {
        self.inner.requests_failed_open.load(Ordering::Relaxed)
    }

    /// Requests that bypassed limiting.
    pub fn requests_skipped(&self) -> u64 {
        self.inner.requests_skipped.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_allowed: self.requests_allowed(),
            requests_denied: self.requests_denied(),
            requests_failed_open: self.requests_failed_open(),
            requests_skipped: self.requests_skipped(),
        }
    }

    /// Reset all metrics to zero.
    pub fn reset(&self) {
        self.inner.requests_allowed.store(0, Ordering::Relaxed);
        self.inner.requests_denied.store(0, Ordering::Relaxed);
        self.inner.requests_failed_open.store(0, Ordering::Relaxed);
        self.inner.requests_skipped.store(0, Ordering::Relaxed);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A point-in-time snapshot of metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Requests admitted by an enforced decision
    pub requests_allowed: u64,
    /// Requests denied for exceeding a quota
    pub requests_denied: u64,
    /// Requests admitted because the store could not be consulted
    pub requests_failed_open: u64,
    /// Requests that bypassed limiting
    pub requests_skipped: u64,
}

impl MetricsSnapshot {
    /// Total requests seen, including skipped ones.
    pub fn total_requests(&self) -> u64 {
        self.requests_allowed
            .saturating_add(self.requests_denied)
            .saturating_add(self.requests_failed_open)
            .saturating_add(self.requests_skipped)
    }

    /// Ratio of denied requests to total requests (0.0 to 1.0).
    ///
    /// Returns 0.0 if no requests have been processed.
    pub fn denial_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            0.0
        } else {
            self.requests_denied as f64 / total as f64
        }
    }

    /// Ratio of requests admitted without enforcement (0.0 to 1.0).
    pub fn fail_open_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            0.0
        } else {
            self.requests_failed_open as f64 / total as f64
        }
    }
}
