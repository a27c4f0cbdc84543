//! Application layer - orchestration of domain logic.
//!
//! This layer coordinates the domain logic and manages the runtime behavior:
//! - Store access guarded by health tracking and timeouts
//! - Limiters (tier counting, sliding window, token bucket)
//! - Subscription tier selection
//! - The per-request guard
//!
//! ## Ports
//!
//! The application layer defines ports (traits) that infrastructure
//! adapters must implement. This keeps the application layer independent
//! from infrastructure details.

pub mod guard;
pub mod guarded_store;
pub mod health;
pub mod metrics;
pub mod ports;
pub mod selector;
pub mod sliding_window;
pub mod store_adapter;
pub mod token_bucket;
