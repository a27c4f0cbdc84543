//! Mock clock for testing.

use crate::application::ports::Clock;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Mock clock for testing.
///
/// Allows tests to control time progression explicitly, enabling deterministic
/// testing of window expiry and bucket refill.
///
/// Clocks may be set backwards to exercise clock-skew handling.
///
/// # Thread Safety
///
/// All clones share the same underlying time value, so advancing time in
/// one clone affects all clones.
#[derive(Debug, Clone)]
pub struct MockClock {
    current_ms: Arc<Mutex<u64>>,
}

impl MockClock {
    /// Create a mock clock starting at `start_ms` milliseconds since the epoch.
    pub fn new(start_ms: u64) -> Self {
        Self {
            current_ms: Arc::new(Mutex::new(start_ms)),
        }
    }

    /// Advance the clock by a duration.
    pub fn advance(&self, duration: Duration) {
        let step: u64 = duration.as_millis().try_into().unwrap_or(u64::MAX);
        let mut now = self
            .current_ms
            .lock()
            .expect("MockClock mutex poisoned - a test thread panicked while holding the lock");
        *now = now.saturating_add(step);
    }

    /// Set the clock to a specific epoch millisecond.
    pub fn set(&self, now_ms: u64) {
        *self
            .current_ms
            .lock()
            .expect("MockClock mutex poisoned - a test thread panicked while holding the lock") =
            now_ms;
    }
}

impl Clock for MockClock {
    fn now_millis(&self) -> u64 {
        *self
            .current_ms
            .lock()
            .expect("MockClock mutex poisoned - a test thread panicked while holding the lock")
    }
}
