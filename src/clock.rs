//! Monotonic time and deadline helpers.
//!
//! All duration logic (rate-limit windows, breaker recovery, handler
//! timeouts) runs on `tokio::time::Instant` so tests can drive it with the
//! paused clock. Wall-clock timestamps on persisted records use `chrono`.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

/// Current monotonic instant.
///
/// Under `#[tokio::test(start_paused = true)]` this follows the paused
/// clock, which is what makes the rate limiter and breakers testable
/// without real sleeps.
pub fn now() -> Instant {
    Instant::now()
}

/// Current wall-clock time, for persisted records and audit trails.
pub fn wall_now() -> DateTime<Utc> {
    Utc::now()
}

/// A deadline derived from a timeout, for cooperative cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// Create a deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: now() + timeout,
        }
    }

    /// The instant the deadline fires.
    pub fn instant(&self) -> Instant {
        self.at
    }

    /// Whether the deadline has already passed.
    pub fn expired(&self) -> bool {
        now() >= self.at
    }

    /// Time remaining, zero if expired.
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expiry_follows_paused_clock() {
        let deadline = Deadline::after(Duration::from_secs(5));
        assert!(!deadline.expired());
        assert!(deadline.remaining() > Duration::from_secs(4));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(deadline.expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }
}
