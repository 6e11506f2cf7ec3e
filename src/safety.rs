//! Deterministic safety overrides.
//!
//! The monitor runs before any model call on every path, including proactive
//! nudges and replayed webhooks. It is pure pattern matching over the raw
//! user input: no model, no network, no stored state beyond the compiled
//! rule set. Its responses are served verbatim and bypass rate limits and
//! both circuit breakers.

use regex::Regex;
use tracing::warn;

use crate::config::{SafetyConfig, SafetySeverity};
use crate::error::{Error, Result};
use crate::frame::ContextualFrame;
use crate::llm::{LlmResponse, ResponseSource};

/// A compiled safety rule.
struct SafetyRule {
    name: String,
    pattern: Regex,
    severity: SafetySeverity,
    response_text: String,
}

/// Verdict of a safety evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum SafetyVerdict {
    /// A rule matched; serve this response verbatim and skip every model
    /// tier.
    Override {
        rule: String,
        severity: SafetySeverity,
        response: LlmResponse,
    },
    /// No rule matched.
    Proceed,
}

impl SafetyVerdict {
    /// Whether this verdict overrides normal processing.
    pub fn is_override(&self) -> bool {
        matches!(self, SafetyVerdict::Override { .. })
    }
}

/// Deterministic hard-coded safety monitor.
pub struct SafetyMonitor {
    rules: Vec<SafetyRule>,
    emergency_fallback_text: String,
}

impl SafetyMonitor {
    /// Compile a monitor from configuration. Fails on an invalid pattern
    /// rather than silently dropping a rule.
    pub fn new(config: SafetyConfig) -> Result<Self> {
        let rules = config
            .rules
            .into_iter()
            .map(|rule| {
                let pattern = Regex::new(&rule.pattern).map_err(|e| {
                    Error::Config(format!("safety rule '{}': {}", rule.name, e))
                })?;
                Ok(SafetyRule {
                    name: rule.name,
                    pattern,
                    severity: rule.severity,
                    response_text: rule.response_text,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            rules,
            emergency_fallback_text: config.emergency_fallback_text,
        })
    }

    fn hard_coded(text: &str) -> LlmResponse {
        LlmResponse {
            text: text.to_string(),
            source: ResponseSource::HardCoded,
            confidence: 1.0,
            model: "safety_monitor".to_string(),
            latency_ms: 0,
        }
    }

    /// Evaluate raw user input against the rule set, first match wins.
    ///
    /// The frame is available for context but never required; the decision
    /// is a function of the input alone.
    pub fn evaluate(&self, user_input: &str, _frame: Option<&ContextualFrame>) -> SafetyVerdict {
        for rule in &self.rules {
            if rule.pattern.is_match(user_input) {
                warn!(rule = %rule.name, severity = ?rule.severity, "safety override triggered");
                return SafetyVerdict::Override {
                    rule: rule.name.clone(),
                    severity: rule.severity,
                    response: Self::hard_coded(&rule.response_text),
                };
            }
        }
        SafetyVerdict::Proceed
    }

    /// Emergency evaluation: only the critical set is consulted, and a miss
    /// still produces a hard-coded response so the caller never falls back
    /// to anchor mode.
    pub fn evaluate_emergency(&self, user_input: &str) -> SafetyVerdict {
        for rule in &self.rules {
            if rule.severity == SafetySeverity::Critical && rule.pattern.is_match(user_input) {
                warn!(rule = %rule.name, "emergency safety override");
                return SafetyVerdict::Override {
                    rule: rule.name.clone(),
                    severity: rule.severity,
                    response: Self::hard_coded(&rule.response_text),
                };
            }
        }
        SafetyVerdict::Override {
            rule: "emergency_fallback".to_string(),
            severity: SafetySeverity::Critical,
            response: Self::hard_coded(&self.emergency_fallback_text),
        }
    }
}
