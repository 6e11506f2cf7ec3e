//! Process-wide infrastructure circuit breaker.

use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::breaker::Gate;
use crate::clock;
use crate::config::InfraBreakerConfig;
use crate::error::{Error, Result};

/// State of one dependency's circuit.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct InfraCircuitState {
    pub failure_count: u32,
    pub open: bool,
    #[serde(skip)]
    pub last_failure: Option<Instant>,
}

/// Two-state breaker guarding an external dependency.
///
/// Opens after a burst of consecutive exceptions; while open, calls fail
/// fast without touching the dependency. Once the recovery timeout has
/// elapsed since the last failure one probe call is let through: success
/// closes the circuit, failure re-opens it and re-arms the timer.
pub struct InfraBreaker {
    service: String,
    config: InfraBreakerConfig,
    state: Mutex<InfraCircuitState>,
}

impl InfraBreaker {
    /// Create a breaker for one named dependency.
    pub fn new(service: impl Into<String>, config: InfraBreakerConfig) -> Self {
        Self {
            service: service.into(),
            config,
            state: Mutex::new(InfraCircuitState {
                failure_count: 0,
                open: false,
                last_failure: None,
            }),
        }
    }

    /// Name of the protected dependency.
    pub fn service(&self) -> &str {
        &self.service
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InfraCircuitState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether a call may go through right now.
    pub fn check(&self) -> Gate {
        let state = self.lock();
        if !state.open {
            return Gate::Allow;
        }
        let recovered = state
            .last_failure
            .map(|last| {
                clock::now().duration_since(last)
                    >= Duration::from_secs(self.config.recovery_timeout_secs)
            })
            .unwrap_or(true);
        if recovered {
            info!(service = %self.service, "circuit allowing recovery probe");
            Gate::Allow
        } else {
            Gate::Deny
        }
    }

    /// `check()` as a `Result`, for call sites that want to fail fast.
    pub fn guard(&self) -> Result<()> {
        match self.check() {
            Gate::Allow => Ok(()),
            Gate::Deny => Err(Error::service_unavailable(self.service.clone())),
        }
    }

    /// Record the outcome of a call against the dependency.
    pub fn record(&self, success: bool) {
        let mut state = self.lock();
        if success {
            if state.open {
                info!(service = %self.service, "circuit closed after successful probe");
            }
            state.open = false;
            state.failure_count = 0;
            state.last_failure = None;
            return;
        }

        state.failure_count += 1;
        state.last_failure = Some(clock::now());
        if state.failure_count >= self.config.failure_threshold && !state.open {
            warn!(
                service = %self.service,
                failure_count = state.failure_count,
                "circuit opened"
            );
        }
        if state.failure_count >= self.config.failure_threshold {
            state.open = true;
        }
    }

    /// Current state snapshot.
    pub fn snapshot(&self) -> InfraCircuitState {
        *self.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn breaker() -> InfraBreaker {
        InfraBreaker::new(
            "database",
            InfraBreakerConfig {
                failure_threshold: 5,
                recovery_timeout_secs: 60,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_consecutive_failures() {
        let breaker = breaker();
        for _ in 0..4 {
            breaker.record(false);
            assert_eq!(breaker.check(), Gate::Allow);
        }
        breaker.record(false);
        assert_eq!(breaker.check(), Gate::Deny);
        assert!(matches!(
            breaker.guard(),
            Err(Error::ServiceUnavailable { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_interrupts_the_streak() {
        let breaker = breaker();
        for _ in 0..4 {
            breaker.record(false);
        }
        breaker.record(true);
        breaker.record(false);
        assert_eq!(breaker.check(), Gate::Allow);
        assert_eq!(breaker.snapshot().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_after_recovery_timeout() {
        let breaker = breaker();
        for _ in 0..5 {
            breaker.record(false);
        }
        assert_eq!(breaker.check(), Gate::Deny);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(breaker.check(), Gate::Allow);

        // Probe fails: circuit re-opens with a fresh timer
        breaker.record(false);
        assert_eq!(breaker.check(), Gate::Deny);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(breaker.check(), Gate::Deny);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(breaker.check(), Gate::Allow);

        // Probe succeeds: circuit closes
        breaker.record(true);
        assert_eq!(breaker.check(), Gate::Allow);
        assert_eq!(breaker.snapshot().failure_count, 0);
        assert!(!breaker.snapshot().open);
    }
}
