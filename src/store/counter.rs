//! Fixed-window counter state.

use std::time::Duration;

use tokio::time::Instant;

/// Request count for one key within a single fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCounter {
    count: u64,
    expires_at: Instant,
}

impl WindowCounter {
    /// Open a new window at `now` with a count of 1.
    pub fn start(now: Instant, window: Duration) -> Self {
        Self {
            count: 1,
            expires_at: now + window,
        }
    }

    /// Whether the window is still open at `now`.
    pub fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }

    /// Count one more request in this window, or restart the window if it
    /// has closed. Returns the count after the increment.
    pub fn bump(&mut self, now: Instant, window: Duration) -> u64 {
        if self.is_live(now) {
            self.count += 1;
        } else {
            *self = Self::start(now, window);
        }
        self.count
    }

    /// Count at `now`, zero once the window has closed.
    pub fn count_at(&self, now: Instant) -> u64 {
        if self.is_live(now) {
            self.count
        } else {
            0
        }
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }
}
