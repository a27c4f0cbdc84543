//! Shared counting store adapter for named tiers.
//!
//! Exposes the three operations a counting middleware needs (increment,
//! decrement, reset) keyed by `"<tier prefix>:<identity>"`, and hides the
//! sliding-window bookkeeping behind them. Store failures during increment
//! never reach the caller: the adapter reports zero hits and logs the error
//! against the key prefix only.

use crate::application::guarded_store::GuardedStore;
use crate::application::ports::StoreError;
use crate::domain::identity::Identity;
use crate::domain::tier::TierConfig;
use crate::domain::window::IncrementResult;

/// Counting store adapter bound to one tier.
#[derive(Debug, Clone)]
pub struct WindowStoreAdapter {
    prefix: String,
    tier: TierConfig,
    store: GuardedStore,
}

impl WindowStoreAdapter {
    /// Create an adapter for `tier`, storing keys under `prefix`.
    pub fn new(prefix: impl Into<String>, tier: TierConfig, store: GuardedStore) -> Self {
        Self {
            prefix: prefix.into(),
            tier,
            store,
        }
    }

    /// The tier this adapter counts for.
    pub fn tier(&self) -> &TierConfig {
        &self.tier
    }

    /// Key prefix, without the identity part.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The guarded store this adapter writes through.
    pub fn store(&self) -> &GuardedStore {
        &self.store
    }

    /// Full store key for an identity.
    pub fn key(&self, identity: &Identity) -> String {
        format!("{}:{}", self.prefix, identity)
    }

    /// Count a request.
    ///
    /// Fails open: on any store error returns zero hits and a reset one window
    /// from now.
    pub async fn increment(&self, identity: &Identity) -> IncrementResult {
        let key = self.key(identity);
        let now_ms = self.store.now_millis();
        let window_ms = self.tier.window_ms;

        let result = self
            .store
            .run(move |store| async move { store.window_increment(&key, now_ms, window_ms).await })
            .await;

        match result {
            Ok(result) => result,
            Err(e) => {
                self.log_failure("increment", &e);
                IncrementResult {
                    total_hits: 0,
                    reset_time_ms: now_ms.saturating_add(window_ms),
                }
            }
        }
    }

    /// Roll back the most recent count for an identity.
    pub async fn decrement(&self, identity: &Identity) {
        let key = self.key(identity);
        let result = self
            .store
            .run(move |store| async move { store.window_decrement(&key).await })
            .await;

        if let Err(e) = result {
            self.log_failure("decrement", &e);
        }
    }

    /// Clear all counts for an identity.
    ///
    /// Unlike the counting operations, the error is returned so that
    /// administrative callers learn the reset did not happen.
    pub async fn reset_key(&self, identity: &Identity) -> Result<(), StoreError> {
        let key = self.key(identity);
        let result = self
            .store
            .run(move |store| async move { store.delete(&key).await })
            .await;

        match &result {
            Ok(()) => tracing::info!(prefix = %self.prefix, "rate limit key reset"),
            Err(e) => self.log_failure("reset", e),
        }
        result
    }

    fn log_failure(&self, operation: &'static str, error: &StoreError) {
        // Degraded skips were already reported by the health monitor
        if *error == StoreError::Degraded {
            tracing::debug!(prefix = %self.prefix, operation, "store degraded, failing open");
        } else {
            tracing::warn!(
                prefix = %self.prefix,
                operation,
                error = %error,
                "rate limit store operation failed, failing open"
            );
        }
    }
}
