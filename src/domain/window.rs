//! Sliding-window log.
//!
//! Keeps one timestamped, uniquified entry per admitted request, ordered by
//! insertion time. Entries at or before `now - window` are expired and pruned
//! before every count, so the window always ends at "now".

use std::collections::VecDeque;

/// One counted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowEntry {
    /// Epoch milliseconds at which the request was counted
    pub timestamp_ms: u64,
    /// Distinguishes entries recorded in the same millisecond
    pub nonce: u64,
}

/// Result of counting a request unconditionally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncrementResult {
    /// Live entries after the increment, including this one
    pub total_hits: u64,
    /// Epoch milliseconds at which the oldest live entry expires
    pub reset_time_ms: u64,
}

/// Decision of a conditional sliding-window check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowDecision {
    /// Whether the request was admitted
    pub allowed: bool,
    /// Requests still admissible in the current window
    pub remaining: u64,
    /// Epoch milliseconds at which the oldest live entry expires
    pub reset_time_ms: u64,
}

/// Time-ordered log of counted requests for one key.
#[derive(Debug, Clone, Default)]
pub struct SlidingLog {
    entries: VecDeque<WindowEntry>,
    next_nonce: u64,
}

impl SlidingLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove entries that fell out of the window ending at `now_ms`.
    pub fn prune(&mut self, now_ms: u64, window_ms: u64) {
        let cutoff = now_ms.saturating_sub(window_ms);
        while let Some(oldest) = self.entries.front() {
            if oldest.timestamp_ms <= cutoff && now_ms >= window_ms {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record a request at `now_ms`.
    pub fn push(&mut self, now_ms: u64) {
        let nonce = self.next_nonce;
        self.next_nonce = self.next_nonce.wrapping_add(1);
        self.entries.push_back(WindowEntry {
            timestamp_ms: now_ms,
            nonce,
        });
    }

    /// Remove the most recently recorded entry.
    pub fn pop_newest(&mut self) -> Option<WindowEntry> {
        self.entries.pop_back()
    }

    /// Number of entries in the log.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the log is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The oldest entry, if any.
    pub fn oldest(&self) -> Option<&WindowEntry> {
        self.entries.front()
    }

    /// When the oldest entry expires, or `now + window` for an empty log.
    pub fn reset_time(&self, now_ms: u64, window_ms: u64) -> u64 {
        match self.oldest() {
            Some(oldest) => oldest.timestamp_ms.saturating_add(window_ms),
            None => now_ms.saturating_add(window_ms),
        }
    }

    /// Prune, then record a request unconditionally.
    pub fn increment(&mut self, now_ms: u64, window_ms: u64) -> IncrementResult {
        self.prune(now_ms, window_ms);
        self.push(now_ms);
        IncrementResult {
            total_hits: self.len() as u64,
            reset_time_ms: self.reset_time(now_ms, window_ms),
        }
    }

    /// Prune, count, and record the request only if the window has room.
    pub fn check(&mut self, now_ms: u64, window_ms: u64, max_requests: u64) -> WindowDecision {
        self.prune(now_ms, window_ms);
        let count = self.len() as u64;

        if count >= max_requests {
            return WindowDecision {
                allowed: false,
                remaining: 0,
                reset_time_ms: self.reset_time(now_ms, window_ms),
            };
        }

        self.push(now_ms);
        WindowDecision {
            allowed: true,
            remaining: max_requests - count - 1,
            reset_time_ms: self.reset_time(now_ms, window_ms),
        }
    }
}
