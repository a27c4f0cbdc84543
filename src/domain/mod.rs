//! Domain layer - pure rate limiting logic with no I/O.
//!
//! This layer contains the core concepts and invariants of the engine:
//! - Named quota tiers and subscription levels
//! - Caller identity derivation
//! - Sliding-window log arithmetic
//! - Token bucket arithmetic
//!
//! All types in this layer are pure and easily testable.

pub mod bucket;
pub mod identity;
pub mod subscription;
pub mod tier;
pub mod window;
