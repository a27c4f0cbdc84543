//! Named quota tiers.
//!
//! A tier binds a name to a window length, a request ceiling and the message
//! shown to callers who exceed it. Tiers are loaded once at startup and never
//! change afterwards.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Returned when a tier name is not registered.
///
/// This is a configuration defect and should surface during startup
/// validation, never per request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown rate limit tier `{0}`")]
pub struct UnknownTierError(pub String);

/// Returned when a tier or quota definition is malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TierError {
    /// The window length must be greater than zero
    #[error("tier `{0}`: window must be greater than 0")]
    ZeroWindow(String),
    /// The request ceiling must be greater than zero
    #[error("tier `{0}`: max_requests must be greater than 0")]
    ZeroMaxRequests(String),
    /// Two tiers share the same name
    #[error("tier `{0}` is registered twice")]
    Duplicate(String),
}

/// A window length paired with a request ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    /// Sliding window length in milliseconds
    pub window_ms: u64,
    /// Maximum requests admitted within one window
    pub max_requests: u64,
}

impl Quota {
    /// Create a quota from a window and a ceiling.
    pub fn new(window: Duration, max_requests: u64) -> Self {
        Self {
            window_ms: window.as_millis().try_into().unwrap_or(u64::MAX),
            max_requests,
        }
    }

    /// The window length.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub(crate) fn validate(&self, name: &str) -> Result<(), TierError> {
        if self.window_ms == 0 {
            return Err(TierError::ZeroWindow(name.to_string()));
        }
        if self.max_requests == 0 {
            return Err(TierError::ZeroMaxRequests(name.to_string()));
        }
        Ok(())
    }
}

/// A named quota configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierConfig {
    /// Tier name, also used as the store key prefix
    pub name: String,
    /// Sliding window length in milliseconds
    pub window_ms: u64,
    /// Maximum requests admitted within one window
    pub max_requests: u64,
    /// Message returned to callers that exceed the tier
    pub message: String,
}

impl TierConfig {
    /// Create and validate a tier.
    ///
    /// # Errors
    /// Returns `TierError` if the window or ceiling is zero.
    pub fn new(
        name: impl Into<String>,
        window: Duration,
        max_requests: u64,
        message: impl Into<String>,
    ) -> Result<Self, TierError> {
        let quota = Quota::new(window, max_requests);
        let tier = Self {
            name: name.into(),
            window_ms: quota.window_ms,
            max_requests,
            message: message.into(),
        };
        tier.validate()?;
        Ok(tier)
    }

    /// The window length.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Window and ceiling of this tier.
    pub fn quota(&self) -> Quota {
        Quota {
            window_ms: self.window_ms,
            max_requests: self.max_requests,
        }
    }

    /// Check the tier invariants.
    pub fn validate(&self) -> Result<(), TierError> {
        self.quota().validate(&self.name)
    }

    /// The built-in tiers.
    pub fn defaults() -> Vec<TierConfig> {
        const FIFTEEN_MINUTES: u64 = 15 * 60 * 1000;
        const ONE_HOUR: u64 = 60 * 60 * 1000;

        vec![
            TierConfig {
                name: "general".to_string(),
                window_ms: FIFTEEN_MINUTES,
                max_requests: 100,
                message: "Too many requests, please try again later.".to_string(),
            },
            TierConfig {
                name: "auth".to_string(),
                window_ms: FIFTEEN_MINUTES,
                max_requests: 5,
                message: "Too many authentication attempts, please try again later.".to_string(),
            },
            TierConfig {
                name: "sensitive".to_string(),
                window_ms: ONE_HOUR,
                max_requests: 3,
                message: "Too many attempts for this operation, please try again in an hour."
                    .to_string(),
            },
            TierConfig {
                name: "upload".to_string(),
                window_ms: ONE_HOUR,
                max_requests: 20,
                message: "Upload limit reached, please try again later.".to_string(),
            },
        ]
    }
}

/// Static table of named tiers.
#[derive(Debug, Clone, Default)]
pub struct TierRegistry {
    tiers: HashMap<String, TierConfig>,
}

impl TierRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the built-in tiers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for tier in TierConfig::defaults() {
            registry.tiers.insert(tier.name.clone(), tier);
        }
        registry
    }

    /// Build a registry from a list of tiers.
    ///
    /// # Errors
    /// Returns `TierError` if any tier is invalid or a name repeats.
    pub fn from_tiers(tiers: impl IntoIterator<Item = TierConfig>) -> Result<Self, TierError> {
        let mut registry = Self::new();
        for tier in tiers {
            registry.register(tier)?;
        }
        Ok(registry)
    }

    /// Register a tier.
    ///
    /// # Errors
    /// Returns `TierError` if the tier is invalid or already registered.
    pub fn register(&mut self, tier: TierConfig) -> Result<(), TierError> {
        tier.validate()?;
        if self.tiers.contains_key(&tier.name) {
            return Err(TierError::Duplicate(tier.name));
        }
        self.tiers.insert(tier.name.clone(), tier);
        Ok(())
    }

    /// Look up a tier by name.
    pub fn lookup(&self, name: &str) -> Result<&TierConfig, UnknownTierError> {
        self.tiers
            .get(name)
            .ok_or_else(|| UnknownTierError(name.to_string()))
    }

    /// Fail fast if any of the given names is not registered.
    pub fn validate_names<'a>(
        &self,
        names: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), UnknownTierError> {
        for name in names {
            self.lookup(name)?;
        }
        Ok(())
    }

    /// Iterate over all registered tiers.
    pub fn iter(&self) -> impl Iterator<Item = &TierConfig> {
        self.tiers.values()
    }

    /// Number of registered tiers.
    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    /// Check if no tier is registered.
    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }
}
