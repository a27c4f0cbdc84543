//! Token bucket refill-and-consume arithmetic.
//!
//! The same arithmetic runs inside every store backend: in-process for the
//! memory store and as a server-side script for Redis. Keeping it here gives
//! the backends a single reference to agree with.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Returned when bucket parameters are out of range.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum BucketError {
    /// Bucket size must be at least one token
    #[error("bucket size must be at least 1, got {0}")]
    InvalidSize(f64),
    /// Refill rate must be positive and finite
    #[error("refill rate must be positive and finite, got {0}")]
    InvalidRefillRate(f64),
}

/// Size and refill rate of a token bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketParams {
    /// Maximum number of tokens the bucket holds
    pub bucket_size: f64,
    /// Tokens added per second
    pub refill_per_sec: f64,
}

impl BucketParams {
    /// Create validated bucket parameters.
    ///
    /// # Errors
    /// Returns `BucketError` if the size is below one or the rate is not
    /// a positive finite number.
    pub fn new(bucket_size: f64, refill_per_sec: f64) -> Result<Self, BucketError> {
        let params = Self {
            bucket_size,
            refill_per_sec,
        };
        params.validate()?;
        Ok(params)
    }

    /// Check the parameter invariants.
    pub fn validate(&self) -> Result<(), BucketError> {
        if !self.bucket_size.is_finite() || self.bucket_size < 1.0 {
            return Err(BucketError::InvalidSize(self.bucket_size));
        }
        if !self.refill_per_sec.is_finite() || self.refill_per_sec <= 0.0 {
            return Err(BucketError::InvalidRefillRate(self.refill_per_sec));
        }
        Ok(())
    }

    /// Seconds until at least one token is available, rounded up.
    pub fn seconds_until_token(&self, tokens: f64) -> u64 {
        let missing = (1.0 - tokens).max(0.0);
        (missing / self.refill_per_sec).ceil().max(1.0) as u64
    }
}

/// Decision of a consume attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketDecision {
    /// Whether a token was consumed
    pub allowed: bool,
    /// Tokens left after the attempt
    pub tokens_remaining: f64,
}

/// Persisted state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    /// Current token count, `0 <= tokens <= bucket_size`
    pub tokens: f64,
    /// Epoch milliseconds of the last refill
    pub last_refill_ms: u64,
}

impl BucketState {
    /// A full bucket as of `now_ms`.
    pub fn full(params: &BucketParams, now_ms: u64) -> Self {
        Self {
            tokens: params.bucket_size,
            last_refill_ms: now_ms,
        }
    }

    /// Refill for the time elapsed since the last refill, then try to take one
    /// token. A clock that moved backwards refills nothing.
    pub fn consume(&mut self, params: &BucketParams, now_ms: u64) -> BucketDecision {
        let elapsed_secs = now_ms.saturating_sub(self.last_refill_ms) as f64 / 1000.0;
        let refilled = self.tokens + elapsed_secs * params.refill_per_sec;
        self.tokens = refilled.clamp(0.0, params.bucket_size);
        self.last_refill_ms = self.last_refill_ms.max(now_ms);

        let allowed = self.tokens >= 1.0;
        if allowed {
            self.tokens -= 1.0;
        }

        BucketDecision {
            allowed,
            tokens_remaining: self.tokens,
        }
    }
}
