//! Circuit breakers.
//!
//! Two breakers share one shape (`check()` yields an outcome, `record()`
//! feeds results back) but obey different rules: the psychological breaker
//! protects a user from the system (per user, three states, anchor
//! semantics), the infrastructure breaker protects the system from a failing
//! dependency (process-wide, two states, fail-fast semantics).

mod infra;
mod psych;

pub use infra::{InfraBreaker, InfraCircuitState};
pub use psych::{BreakerState, PsychBreaker, PsychGate, UserStateSnapshot};

/// Shared check outcome for breakers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// The call may proceed.
    Allow,
    /// The call must not touch the protected party.
    Deny,
}

impl Gate {
    /// Whether the call may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Gate::Allow)
    }
}
