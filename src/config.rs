//! Startup configuration.
//!
//! A [`ThrottleConfig`] is loaded once, from YAML or through
//! [`ThrottleConfigBuilder`], and validated before any guard is built from it.
//! Every field has a default, so an empty document is a valid configuration:
//!
//! ```yaml
//! key_prefix: "rl:"
//! store_timeout_ms: 50
//! probe_interval_ms: 5000
//! tiers:
//!   - name: auth
//!     window_ms: 900000
//!     max_requests: 5
//!     message: Too many authentication attempts, please try again later.
//! burst:
//!   bucket_size: 10
//!   refill_per_sec: 1
//! skip:
//!   paths: ["/health"]
//!   headers: ["x-internal-probe"]
//! trusted_forwarded_header: x-forwarded-for
//! ```

use crate::application::selector::SubscriptionQuotas;
use crate::domain::bucket::{BucketError, BucketParams};
use crate::domain::identity::RequestContext;
use crate::domain::tier::{TierConfig, TierError, TierRegistry, UnknownTierError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A tier or subscription quota is invalid
    #[error(transparent)]
    Tier(#[from] TierError),
    /// Burst bucket parameters are invalid
    #[error("invalid burst bucket: {0}")]
    Bucket(#[from] BucketError),
    /// A route names a tier that is not configured
    #[error(transparent)]
    UnknownTier(#[from] UnknownTierError),
    /// Key prefix must not be empty
    #[error("key prefix must not be empty")]
    EmptyKeyPrefix,
    /// Store timeout must be positive
    #[error("store timeout must be greater than zero")]
    ZeroStoreTimeout,
    /// Probe interval must be positive
    #[error("probe interval must be greater than zero")]
    ZeroProbeInterval,
    /// Bucket expiry must be positive
    #[error("bucket ttl must be greater than zero")]
    ZeroBucketTtl,
    /// The document is not valid YAML for this schema
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// The configuration file could not be read
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Requests that bypass limiting entirely.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipList {
    /// Path prefixes, matched on segment boundaries (`/health` matches
    /// `/health/live` but not `/healthz`)
    #[serde(default)]
    pub paths: Vec<String>,
    /// Header names whose presence bypasses limiting
    #[serde(default)]
    pub headers: Vec<String>,
}

impl SkipList {
    /// Check if nothing is skipped.
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty() && self.headers.is_empty()
    }

    /// Check if a request bypasses limiting.
    pub fn matches(&self, ctx: &RequestContext) -> bool {
        self.paths
            .iter()
            .any(|prefix| path_has_prefix(&ctx.path, prefix))
            || self
                .headers
                .iter()
                .any(|name| ctx.header(name).is_some())
    }
}

fn path_has_prefix(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
        None => false,
    }
}

fn default_key_prefix() -> String {
    "rl:".to_string()
}

fn default_store_timeout_ms() -> u64 {
    50
}

fn default_probe_interval_ms() -> u64 {
    5_000
}

fn default_bucket_ttl_ms() -> u64 {
    60 * 60 * 1000
}

/// Complete configuration of a rate limit guard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Prefix prepended to every store key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Upper bound on a single store round-trip
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    /// Interval between store probes while it is degraded
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    /// Named fixed tiers
    #[serde(default = "TierConfig::defaults")]
    pub tiers: Vec<TierConfig>,
    /// Per-subscription quotas for subscription-routed requests
    #[serde(default)]
    pub subscriptions: SubscriptionQuotas,
    /// Optional per-identity burst bucket checked before any window
    #[serde(default)]
    pub burst: Option<BucketParams>,
    /// Expiry of idle burst buckets
    #[serde(default = "default_bucket_ttl_ms")]
    pub bucket_ttl_ms: u64,
    /// Requests that bypass limiting
    #[serde(default)]
    pub skip: SkipList,
    /// Header whose first hop is trusted as the client address
    #[serde(default)]
    pub trusted_forwarded_header: Option<String>,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            store_timeout_ms: default_store_timeout_ms(),
            probe_interval_ms: default_probe_interval_ms(),
            tiers: TierConfig::defaults(),
            subscriptions: SubscriptionQuotas::default(),
            burst: None,
            bucket_ttl_ms: default_bucket_ttl_ms(),
            skip: SkipList::default(),
            trusted_forwarded_header: None,
        }
    }
}

impl ThrottleConfig {
    /// Create a builder starting from the defaults.
    pub fn builder() -> ThrottleConfigBuilder {
        ThrottleConfigBuilder {
            config: Self::default(),
        }
    }

    /// Parse and validate a YAML document.
    ///
    /// # Errors
    /// Returns `ConfigError::Parse` for malformed YAML and a validation error
    /// for out-of-range values.
    pub fn from_yaml(source: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&source)
    }

    /// Check every invariant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key_prefix.is_empty() {
            return Err(ConfigError::EmptyKeyPrefix);
        }
        if self.store_timeout_ms == 0 {
            return Err(ConfigError::ZeroStoreTimeout);
        }
        if self.probe_interval_ms == 0 {
            return Err(ConfigError::ZeroProbeInterval);
        }
        if self.bucket_ttl_ms == 0 {
            return Err(ConfigError::ZeroBucketTtl);
        }
        self.tier_registry()?;
        self.subscriptions.validate()?;
        if let Some(burst) = &self.burst {
            burst.validate()?;
        }
        Ok(())
    }

    /// Build the tier registry, rejecting invalid or duplicate tiers.
    pub fn tier_registry(&self) -> Result<TierRegistry, TierError> {
        TierRegistry::from_tiers(self.tiers.iter().cloned())
    }

    /// Check that every tier a route table refers to is configured.
    ///
    /// Call at startup with the tier names of all tier-routed endpoints.
    pub fn validate_routes<'a>(
        &self,
        tier_names: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), ConfigError> {
        self.tier_registry()?.validate_names(tier_names)?;
        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn bucket_ttl(&self) -> Duration {
        Duration::from_millis(self.bucket_ttl_ms)
    }
}

/// Builder for [`ThrottleConfig`].
#[derive(Debug, Clone)]
pub struct ThrottleConfigBuilder {
    config: ThrottleConfig,
}

impl ThrottleConfigBuilder {
    /// Set the store key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.key_prefix = prefix.into();
        self
    }

    /// Set the per-operation store timeout.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.config.store_timeout_ms = duration_ms(timeout);
        self
    }

    /// Set how often a degraded store is probed.
    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.config.probe_interval_ms = duration_ms(interval);
        self
    }

    /// Replace the tier table.
    pub fn with_tiers(mut self, tiers: Vec<TierConfig>) -> Self {
        self.config.tiers = tiers;
        self
    }

    /// Add a tier, replacing any existing tier with the same name.
    pub fn with_tier(mut self, tier: TierConfig) -> Self {
        self.config.tiers.retain(|t| t.name != tier.name);
        self.config.tiers.push(tier);
        self
    }

    /// Set the subscription quotas.
    pub fn with_subscriptions(mut self, quotas: SubscriptionQuotas) -> Self {
        self.config.subscriptions = quotas;
        self
    }

    /// Enable the per-identity burst bucket.
    pub fn with_burst(mut self, params: BucketParams) -> Self {
        self.config.burst = Some(params);
        self
    }

    /// Set the expiry of idle burst buckets.
    pub fn with_bucket_ttl(mut self, ttl: Duration) -> Self {
        self.config.bucket_ttl_ms = duration_ms(ttl);
        self
    }

    /// Bypass limiting for paths under `prefix`.
    pub fn skip_path(mut self, prefix: impl Into<String>) -> Self {
        self.config.skip.paths.push(prefix.into());
        self
    }

    /// Bypass limiting for requests carrying header `name`.
    pub fn skip_header(mut self, name: impl Into<String>) -> Self {
        self.config.skip.headers.push(name.into());
        self
    }

    /// Trust the first hop of `header` as the client address.
    pub fn with_trusted_forwarded_header(mut self, header: impl Into<String>) -> Self {
        self.config.trusted_forwarded_header = Some(header.into());
        self
    }

    /// Validate and return the configuration.
    ///
    /// # Errors
    /// Returns `ConfigError` if any value is out of range.
    pub fn build(self) -> Result<ThrottleConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}
