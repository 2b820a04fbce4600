//! Fixed-window outbound rate limiter.

use std::time::Duration;

use tokio::time::Instant;

/// Length of one rate window.
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Counts messages sent in the current window.
///
/// The count never exceeds the budget: a rejected attempt is not counted.
#[derive(Debug, Clone)]
pub struct RateWindow {
    budget: u32,
    started: Instant,
    count: u32,
}

impl RateWindow {
    pub fn new(budget: u32, now: Instant) -> Self {
        Self {
            budget,
            started: now,
            count: 0,
        }
    }

    /// Record one message if the budget allows it.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.roll(now);
        if self.count >= self.budget {
            return false;
        }
        self.count += 1;
        true
    }

    /// Messages counted in the window containing `now`.
    pub fn count(&mut self, now: Instant) -> u32 {
        self.roll(now);
        self.count
    }

    pub fn budget(&self) -> u32 {
        self.budget
    }

    fn roll(&mut self, now: Instant) {
        if now.saturating_duration_since(self.started) >= RATE_WINDOW {
            self.started = now;
            self.count = 0;
        }
    }
}
