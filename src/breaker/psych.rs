//! Per-user psychological circuit breaker.
//!
//! This is a safety mechanism, not a reliability mechanism: after enough
//! consecutive failures the system deliberately underreacts, answering in
//! anchor mode instead of escalating at a user who has stopped engaging.
//! Recovery is tested gently after a quiet period.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::clock;
use crate::config::PsychBreakerConfig;

/// Circuit state for one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Normal operation.
    Closed,
    /// Tripped; the loop answers in anchor mode.
    Open,
    /// Testing recovery: one interaction decides.
    HalfOpen,
}

/// Volatile per-user breaker state.
///
/// `Open` always carries a `next_test_at`; a success always lands in
/// `Closed` with a zero failure count. Transitions are serialized per user
/// by the lock around this struct.
#[derive(Debug)]
struct UserState {
    state: BreakerState,
    failure_count: u32,
    last_failure: Option<DateTime<Utc>>,
    next_test_at: Option<Instant>,
}

impl UserState {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            last_failure: None,
            next_test_at: None,
        }
    }
}

/// Read-only view of one user's breaker state.
#[derive(Debug, Clone, Serialize)]
pub struct UserStateSnapshot {
    pub state: BreakerState,
    pub failure_count: u32,
    pub last_failure: Option<DateTime<Utc>>,
}

/// Gate outcome for a loop invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsychGate {
    /// Proceed normally (includes the half-open recovery test).
    Proceed,
    /// The circuit is open; answer in anchor mode.
    Anchor,
}

/// Per-user psychological circuit breaker.
pub struct PsychBreaker {
    config: PsychBreakerConfig,
    users: RwLock<HashMap<String, Arc<Mutex<UserState>>>>,
}

impl PsychBreaker {
    /// Create a breaker from configuration.
    pub fn new(config: PsychBreakerConfig) -> Self {
        Self {
            config,
            users: RwLock::new(HashMap::new()),
        }
    }

    fn user(&self, user_id: &str) -> Arc<Mutex<UserState>> {
        if let Some(existing) = self
            .users
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(user_id)
        {
            return Arc::clone(existing);
        }
        let mut users = self
            .users
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            users
                .entry(user_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(UserState::new()))),
        )
    }

    fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.config.recovery_timeout_secs)
    }

    /// Check whether a loop invocation for this user may proceed.
    ///
    /// An open circuit whose test deadline has passed moves to half-open and
    /// lets the invocation through as the recovery probe.
    pub fn gate(&self, user_id: &str) -> PsychGate {
        let user = self.user(user_id);
        let mut state = user.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        match state.state {
            BreakerState::Closed | BreakerState::HalfOpen => PsychGate::Proceed,
            BreakerState::Open => {
                let due = state
                    .next_test_at
                    .map(|at| clock::now() >= at)
                    .unwrap_or(true);
                if due {
                    info!(user_id, "circuit breaker entering recovery test");
                    state.state = BreakerState::HalfOpen;
                    PsychGate::Proceed
                } else {
                    PsychGate::Anchor
                }
            }
        }
    }

    /// Record the outcome of an invocation. Returns whether this record
    /// tripped the circuit.
    pub fn record(&self, user_id: &str, success: bool) -> bool {
        let user = self.user(user_id);
        let mut state = user.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if success {
            if state.state != BreakerState::Closed {
                info!(user_id, "circuit breaker recovery detected");
            }
            state.state = BreakerState::Closed;
            state.failure_count = 0;
            state.last_failure = None;
            state.next_test_at = None;
            return false;
        }

        state.failure_count += 1;
        state.last_failure = Some(clock::wall_now());

        let trip = match state.state {
            // A failed recovery test re-opens immediately.
            BreakerState::HalfOpen => true,
            BreakerState::Closed => state.failure_count >= self.config.failure_threshold,
            BreakerState::Open => false,
        };

        if trip {
            warn!(
                user_id,
                failure_count = state.failure_count,
                "circuit breaker tripped"
            );
            state.state = BreakerState::Open;
            state.next_test_at = Some(clock::now() + self.recovery_timeout());
        }

        trip
    }

    /// Read-only snapshot of one user's state, if the user has been seen.
    pub fn snapshot(&self, user_id: &str) -> Option<UserStateSnapshot> {
        let users = self
            .users
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        users.get(user_id).map(|user| {
            let state = user.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            UserStateSnapshot {
                state: state.state,
                failure_count: state.failure_count,
                last_failure: state.last_failure,
            }
        })
    }

    /// Number of users currently in the open state.
    pub fn open_count(&self) -> usize {
        let users = self
            .users
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        users
            .values()
            .filter(|user| {
                user.lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .state
                    == BreakerState::Open
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn breaker() -> PsychBreaker {
        PsychBreaker::new(PsychBreakerConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_trips_after_threshold_failures() {
        let breaker = breaker();

        assert!(!breaker.record("u1", false));
        assert!(!breaker.record("u1", false));
        assert_eq!(breaker.gate("u1"), PsychGate::Proceed);

        assert!(breaker.record("u1", false));
        assert_eq!(breaker.gate("u1"), PsychGate::Anchor);
        assert_eq!(breaker.snapshot("u1").unwrap().state, BreakerState::Open);
        assert_eq!(breaker.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_closed_failure_count() {
        let breaker = breaker();

        breaker.record("u1", false);
        breaker.record("u1", false);
        breaker.record("u1", true);
        assert_eq!(breaker.snapshot("u1").unwrap().failure_count, 0);

        // The streak starts over
        breaker.record("u1", false);
        breaker.record("u1", false);
        assert_eq!(breaker.gate("u1"), PsychGate::Proceed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_moves_to_half_open_after_timeout() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record("u1", false);
        }
        assert_eq!(breaker.gate("u1"), PsychGate::Anchor);

        tokio::time::advance(Duration::from_secs(2 * 3600 + 1)).await;
        assert_eq!(breaker.gate("u1"), PsychGate::Proceed);
        assert_eq!(
            breaker.snapshot("u1").unwrap().state,
            BreakerState::HalfOpen
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record("u1", false);
        }
        tokio::time::advance(Duration::from_secs(2 * 3600 + 1)).await;
        assert_eq!(breaker.gate("u1"), PsychGate::Proceed);

        breaker.record("u1", true);
        assert_eq!(breaker.snapshot("u1").unwrap().state, BreakerState::Closed);
        assert_eq!(breaker.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_with_fresh_deadline() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record("u1", false);
        }
        tokio::time::advance(Duration::from_secs(2 * 3600 + 1)).await;
        assert_eq!(breaker.gate("u1"), PsychGate::Proceed);

        assert!(breaker.record("u1", false));
        assert_eq!(breaker.gate("u1"), PsychGate::Anchor);

        // Only a fresh full recovery period re-arms the test
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(breaker.gate("u1"), PsychGate::Anchor);
        tokio::time::advance(Duration::from_secs(3600 + 1)).await;
        assert_eq!(breaker.gate("u1"), PsychGate::Proceed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_users_are_independent() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record("u1", false);
        }
        assert_eq!(breaker.gate("u1"), PsychGate::Anchor);
        assert_eq!(breaker.gate("u2"), PsychGate::Proceed);
    }

    proptest! {
        /// Any failure run ending in one success lands closed with a zero
        /// failure count.
        #[test]
        fn failures_then_success_end_closed(n_failures in 0u32..10) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();
            runtime.block_on(async {
                let breaker = breaker();
                for _ in 0..n_failures {
                    breaker.record("u1", false);
                }
                breaker.record("u1", true);
                let snapshot = breaker.snapshot("u1").unwrap();
                prop_assert_eq!(snapshot.state, BreakerState::Closed);
                prop_assert_eq!(snapshot.failure_count, 0);
                Ok(())
            })?;
        }

        /// At or past the threshold without a success, the circuit is open
        /// and anchors every gate check inside the recovery window.
        #[test]
        fn threshold_failures_anchor_until_test_time(n_failures in 3u32..10) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();
            runtime.block_on(async {
                let breaker = breaker();
                for _ in 0..n_failures {
                    breaker.record("u1", false);
                }
                prop_assert_eq!(breaker.snapshot("u1").unwrap().state, BreakerState::Open);
                tokio::time::advance(Duration::from_secs(3600)).await;
                prop_assert_eq!(breaker.gate("u1"), PsychGate::Anchor);
                Ok(())
            })?;
        }
    }
}
