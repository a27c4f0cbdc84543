//! Store health tracking for fail-open rate limiting.
//!
//! Each limiter prefix owns a [`HealthMonitor`], a small state machine over
//! `Unknown`, `Available` and `Degraded`. While degraded, limiters skip the
//! store and admit every request; one probe per `probe_interval` is let
//! through to detect recovery. Every transition is logged exactly once, no
//! matter how many concurrent requests observe it.

use crate::application::ports::{Clock, CountingStore, StoreError};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Availability of the shared store as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// No round-trip has completed yet
    Unknown = 0,
    /// The last round-trip succeeded, limits are enforced
    Available = 1,
    /// The last round-trip failed, limits fail open
    Degraded = 2,
}

impl From<u8> for HealthState {
    fn from(value: u8) -> Self {
        match value {
            1 => HealthState::Available,
            2 => HealthState::Degraded,
            _ => HealthState::Unknown,
        }
    }
}

/// A state change, passed to the transition listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTransition {
    /// Key prefix of the monitored limiter
    pub prefix: String,
    /// State before the change
    pub from: HealthState,
    /// State after the change
    pub to: HealthState,
    /// Epoch milliseconds of the observation that caused it
    pub at_ms: u64,
}

/// Callback invoked once per transition, after it is logged.
pub type TransitionListener = Arc<dyn Fn(&HealthTransition) + Send + Sync>;

/// Configuration for health monitoring.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Minimum time between store probes while degraded
    pub probe_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(5),
        }
    }
}

/// Tracks store availability for one limiter prefix.
pub struct HealthMonitor {
    prefix: String,
    state: AtomicU8,
    last_checked_ms: AtomicU64,
    transitions: AtomicU64,
    config: HealthConfig,
    listener: Option<TransitionListener>,
}

impl fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("prefix", &self.prefix)
            .field("state", &self.state())
            .field("last_checked_ms", &self.last_checked_ms())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HealthMonitor {
    /// Create a monitor with default configuration.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self::with_config(prefix, HealthConfig::default())
    }

    /// Create a monitor with custom configuration.
    pub fn with_config(prefix: impl Into<String>, config: HealthConfig) -> Self {
        Self {
            prefix: prefix.into(),
            state: AtomicU8::new(HealthState::Unknown as u8),
            last_checked_ms: AtomicU64::new(0),
            transitions: AtomicU64::new(0),
            config,
            listener: None,
        }
    }

    /// Register a callback run on every transition.
    pub fn with_listener(mut self, listener: TransitionListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Key prefix this monitor covers.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Current state.
    pub fn state(&self) -> HealthState {
        HealthState::from(self.state.load(Ordering::Acquire))
    }

    /// Epoch milliseconds of the last recorded round-trip or probe claim.
    pub fn last_checked_ms(&self) -> u64 {
        self.last_checked_ms.load(Ordering::Acquire)
    }

    /// Number of transitions since creation.
    pub fn transitions(&self) -> u64 {
        self.transitions.load(Ordering::Relaxed)
    }

    /// Whether an operation at `now_ms` should reach the store.
    ///
    /// Always true unless degraded. While degraded, exactly one caller per
    /// probe interval gets `true`; everyone else fails open without touching
    /// the store.
    pub fn should_attempt(&self, now_ms: u64) -> bool {
        if self.state() != HealthState::Degraded {
            return true;
        }

        let last = self.last_checked_ms.load(Ordering::Acquire);
        let interval_ms = self.config.probe_interval.as_millis() as u64;
        if now_ms.saturating_sub(last) < interval_ms {
            return false;
        }

        // Only the caller that wins the exchange probes
        self.last_checked_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Record a successful round-trip.
    pub fn record_success(&self, now_ms: u64) {
        self.last_checked_ms.store(now_ms, Ordering::Release);
        let previous =
            HealthState::from(self.state.swap(HealthState::Available as u8, Ordering::AcqRel));

        match previous {
            HealthState::Available => {}
            HealthState::Unknown => {
                tracing::debug!(prefix = %self.prefix, "rate limit store reachable");
                self.notify(previous, HealthState::Available, now_ms);
            }
            HealthState::Degraded => {
                tracing::info!(
                    prefix = %self.prefix,
                    "rate limit store recovered, enforcing limits again"
                );
                self.notify(previous, HealthState::Available, now_ms);
            }
        }
    }

    /// Record a failed round-trip.
    pub fn record_failure(&self, now_ms: u64, error: &StoreError) {
        self.last_checked_ms.store(now_ms, Ordering::Release);
        let previous =
            HealthState::from(self.state.swap(HealthState::Degraded as u8, Ordering::AcqRel));

        if previous != HealthState::Degraded {
            tracing::warn!(
                prefix = %self.prefix,
                error = %error,
                "rate limit store unavailable, failing open"
            );
            self.notify(previous, HealthState::Degraded, now_ms);
        }
    }

    /// Probe the store once and record the outcome.
    ///
    /// Returns `true` if the store answered in time.
    pub async fn probe(&self, store: &dyn CountingStore, clock: &dyn Clock, timeout: Duration) -> bool {
        let result = match tokio::time::timeout(timeout, store.ping()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(timeout)),
        };

        let now_ms = clock.now_millis();
        match result {
            Ok(()) => {
                self.record_success(now_ms);
                true
            }
            Err(e) => {
                self.record_failure(now_ms, &e);
                false
            }
        }
    }

    /// Spawn a background task that probes the store every probe interval
    /// while it is not known to be available.
    ///
    /// Lets enforcement resume after an outage even when no traffic arrives
    /// to trigger an inline probe. Abort the returned handle to stop it.
    pub fn spawn_prober(
        self: &Arc<Self>,
        store: Arc<dyn CountingStore>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.probe_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if monitor.state() != HealthState::Available {
                    monitor.probe(store.as_ref(), clock.as_ref(), timeout).await;
                }
            }
        })
    }

    /// Forget all observations.
    pub fn reset(&self) {
        self.state
            .store(HealthState::Unknown as u8, Ordering::Release);
        self.last_checked_ms.store(0, Ordering::Release);
    }

    fn notify(&self, from: HealthState, to: HealthState, at_ms: u64) {
        self.transitions.fetch_add(1, Ordering::Relaxed);
        if let Some(listener) = &self.listener {
            listener(&HealthTransition {
                prefix: self.prefix.clone(),
                from,
                to,
                at_ms,
            });
        }
    }
}
