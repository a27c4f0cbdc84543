//! Subscription-aware limiter selection.

use crate::application::sliding_window::{QuotaLimiter, SlidingWindowLimiter};
use crate::domain::subscription::SubscriptionTier;
use crate::domain::tier::{Quota, TierError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Quota per subscription tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionQuotas {
    /// Quota for `free`, also the fallback for unknown tiers
    pub free: Quota,
    /// Quota for `basic`
    pub basic: Quota,
    /// Quota for `pro`
    pub pro: Quota,
    /// Quota for `enterprise`
    pub enterprise: Quota,
}

impl SubscriptionQuotas {
    /// Quota of a tier.
    pub fn get(&self, tier: SubscriptionTier) -> Quota {
        match tier {
            SubscriptionTier::Free => self.free,
            SubscriptionTier::Basic => self.basic,
            SubscriptionTier::Pro => self.pro,
            SubscriptionTier::Enterprise => self.enterprise,
        }
    }

    /// Check that every tier has a positive window and ceiling.
    pub fn validate(&self) -> Result<(), TierError> {
        for tier in SubscriptionTier::ALL {
            self.get(tier).validate(tier.as_str())?;
        }
        Ok(())
    }
}

impl Default for SubscriptionQuotas {
    fn default() -> Self {
        let fifteen_minutes = Duration::from_secs(15 * 60);
        Self {
            free: Quota::new(fifteen_minutes, 100),
            basic: Quota::new(fifteen_minutes, 500),
            pro: Quota::new(fifteen_minutes, 2_000),
            enterprise: Quota::new(fifteen_minutes, 10_000),
        }
    }
}

/// Picks the pre-built limiter for a caller's subscription tier.
///
/// Each tier gets its own key prefix, so upgrading a caller starts a fresh
/// window rather than inheriting counts recorded under a smaller quota.
#[derive(Debug, Clone)]
pub struct TierSelector {
    limiters: [QuotaLimiter; 4],
}

impl TierSelector {
    /// Build one limiter per tier. `build` receives the tier and returns the
    /// sliding-window limiter to bind its quota to.
    pub fn new<F>(quotas: SubscriptionQuotas, mut build: F) -> Self
    where
        F: FnMut(SubscriptionTier) -> SlidingWindowLimiter,
    {
        let limiters = SubscriptionTier::ALL.map(|tier| QuotaLimiter::new(build(tier), quotas.get(tier)));
        Self { limiters }
    }

    /// Limiter for a resolved tier.
    pub fn limiter(&self, tier: SubscriptionTier) -> &QuotaLimiter {
        &self.limiters[tier as usize]
    }

    /// Limiter for raw tier metadata. Missing or unrecognised metadata selects
    /// the `free` limiter; absent metadata never causes a denial by itself.
    pub fn select(&self, tier: Option<&str>) -> &QuotaLimiter {
        self.limiter(SubscriptionTier::from_metadata(tier))
    }
}
