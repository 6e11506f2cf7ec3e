//! Runtime configuration bundle.
//!
//! Every tunable the core reads lives here, deserializable from one document
//! and defaulting to the values the runtime was designed around. Components
//! take the section they need by value at construction; nothing reads
//! configuration globals after wiring.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::frame::ContextKind;

/// Top-level configuration for the runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub rate_limit: RateLimitConfig,
    pub psych_breaker: PsychBreakerConfig,
    pub infra_breaker: InfraBreakerConfig,
    pub frame: FrameConfig,
    pub safety: SafetyConfig,
    pub llm: LlmConfig,
    pub webhook: WebhookConfig,
    pub nudge: NudgeConfig,
}

/// Sliding-window rate limiter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Capacity of the hourly (3600 s) window.
    pub hourly_capacity: usize,
    /// Capacity of the per-minute (60 s) window.
    pub minute_capacity: usize,
    /// Capacity of the burst (10 s) window.
    pub burst_capacity: usize,
    /// Capacity for lazily created per-endpoint windows (60 s each).
    pub endpoint_capacity: usize,
    /// Grace added to upstream-quota reset waits.
    pub quota_grace_secs: u64,
    /// Upper bound on `wait_until_admitted`.
    pub max_wait_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            hourly_capacity: 4000,
            minute_capacity: 60,
            burst_capacity: 10,
            endpoint_capacity: 30,
            quota_grace_secs: 5,
            max_wait_secs: 300,
        }
    }
}

/// Per-user psychological circuit breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PsychBreakerConfig {
    /// Consecutive failures before the circuit trips.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a recovery test.
    pub recovery_timeout_secs: u64,
    /// The minimal non-demanding message served while open.
    pub anchor_text: String,
}

impl Default for PsychBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout_secs: 2 * 3600,
            anchor_text: "I notice you might need some space right now. \
                          I'm here when you're ready, no pressure. \
                          Take care of yourself."
                .to_string(),
        }
    }
}

/// Process-wide infrastructure circuit breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InfraBreakerConfig {
    /// Consecutive dependency errors before failing fast.
    pub failure_threshold: u32,
    /// Seconds of quiet before a probe call is allowed through.
    pub recovery_timeout_secs: u64,
}

impl Default for InfraBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
        }
    }
}

/// Frame assembly and scoring settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    /// TTL for cached frames keyed by (user, agent, task focus).
    pub cache_ttl_secs: u64,
    /// Total budget for one frame build.
    pub build_timeout_secs: u64,
    /// Budget for any one context source inside a build.
    pub source_timeout_secs: u64,
    /// How many recent traces feed the frame.
    pub trace_limit: usize,
    /// Per-kind cognitive-load weights; missing kinds use `default_weight`.
    pub load_weights: HashMap<ContextKind, f64>,
    /// Weight for context kinds absent from `load_weights`.
    pub default_weight: f64,
    /// Load above which the frame recommends simplifying context.
    pub load_high_water: f64,
    /// Accessibility below which the frame recommends clarifying focus.
    pub accessibility_low_water: f64,
}

impl Default for FrameConfig {
    fn default() -> Self {
        let mut load_weights = HashMap::new();
        load_weights.insert(ContextKind::MemoryTrace, 0.04);
        load_weights.insert(ContextKind::CalendarEvent, 0.08);
        load_weights.insert(ContextKind::UserState, 0.05);
        load_weights.insert(ContextKind::Environment, 0.06);
        load_weights.insert(ContextKind::Task, 0.10);
        load_weights.insert(ContextKind::Achievement, 0.03);

        Self {
            cache_ttl_secs: 3600,
            build_timeout_secs: 5,
            source_timeout_secs: 2,
            trace_limit: 10,
            load_weights,
            default_weight: 0.05,
            load_high_water: 0.8,
            accessibility_low_water: 0.5,
        }
    }
}

/// A single deterministic safety rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyRuleConfig {
    /// Stable rule name recorded in traces.
    pub name: String,
    /// Regex applied to the raw user input.
    pub pattern: String,
    /// Rule severity; `critical` rules form the emergency set.
    pub severity: SafetySeverity,
    /// Canned response served verbatim on match.
    pub response_text: String,
}

/// Severity attached to a safety rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetySeverity {
    Critical,
    High,
    Medium,
}

/// Safety monitor rule set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Ordered rules; first match wins.
    pub rules: Vec<SafetyRuleConfig>,
    /// Response served on the emergency entry point when no rule matches.
    pub emergency_fallback_text: String,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            rules: vec![
                SafetyRuleConfig {
                    name: "crisis".to_string(),
                    pattern: r"(?i)\b(suicid\w*|kill myself|self[- ]harm|hurt myself|end it all)\b"
                        .to_string(),
                    severity: SafetySeverity::Critical,
                    response_text: "It sounds like you're going through something really hard \
                                    right now. You deserve support from a real person: please \
                                    reach out to a crisis line (call or text 988 in the US) or \
                                    someone you trust. I'm staying right here with you."
                        .to_string(),
                },
                SafetyRuleConfig {
                    name: "medical_decision".to_string(),
                    pattern: r"(?i)\b(should i (stop|start|change)( taking)?( my)? med\w*|diagnos\w* me|what dosage)\b"
                        .to_string(),
                    severity: SafetySeverity::High,
                    response_text: "I can't make medical decisions with you, that one needs a \
                                    clinician who knows your history. I can help you write down \
                                    the questions you want to bring to them."
                        .to_string(),
                },
                SafetyRuleConfig {
                    name: "legal_decision".to_string(),
                    pattern: r"(?i)\b(should i sue|sign (this|the) contract|legal advice)\b"
                        .to_string(),
                    severity: SafetySeverity::High,
                    response_text: "That's a call for a lawyer, not for me. I can help you \
                                    organize the facts before you talk to one."
                        .to_string(),
                },
            ],
            emergency_fallback_text: "I'm here with you right now. If you're in immediate \
                                      danger, please contact emergency services. Otherwise, \
                                      tell me what's happening and we'll take it one small \
                                      step at a time."
                .to_string(),
        }
    }
}

/// Model routing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Canned intent table for the pattern-match tier, in priority order.
    /// Keys are matched against normalized (lowercased, trimmed) input.
    pub intents: Vec<(String, String)>,
    /// TTL for the local response cache.
    pub cache_ttl_secs: u64,
    /// Per-call cloud timeout.
    pub cloud_timeout_secs: u64,
    /// Bounded retries on transient cloud failure.
    pub cloud_max_retries: u32,
    /// Max tokens requested from the cloud model.
    pub max_tokens: u32,
    /// Sampling temperature for cloud calls.
    pub temperature: f32,
    /// Last-resort response when every tier fails.
    pub fallback_text: String,
    /// Confidence attached to the fallback response.
    pub fallback_confidence: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            intents: vec![
                (
                    "hello".to_string(),
                    "Hey! Good to see you. What's on your plate today?".to_string(),
                ),
                (
                    "thanks".to_string(),
                    "Anytime. You did the hard part.".to_string(),
                ),
                (
                    "i'm stuck".to_string(),
                    "Stuck is a starting point. What's the smallest piece you could poke at \
                     for two minutes?"
                        .to_string(),
                ),
            ],
            cache_ttl_secs: 300,
            cloud_timeout_secs: 30,
            cloud_max_retries: 2,
            max_tokens: 1500,
            temperature: 0.7,
            fallback_text: "I'm having trouble reaching my full brain right now. \
                            Short version: pick the smallest next step and I'll be \
                            back with you shortly."
                .to_string(),
            fallback_confidence: 0.3,
        }
    }
}

/// Webhook router settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Shared secret for HMAC verification; `None` disables verification.
    pub secret: Option<String>,
    /// How long a delivery id stays deduplicated.
    pub dedup_window_secs: u64,
    /// Bound on remembered delivery ids.
    pub dedup_capacity: usize,
    /// Per-handler execution budget.
    pub handler_timeout_secs: u64,
    /// Commit-message keywords that mark a push as completing work.
    pub completion_keywords: Vec<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: None,
            dedup_window_secs: 600,
            dedup_capacity: 1024,
            handler_timeout_secs: 5,
            completion_keywords: vec![
                "closes".to_string(),
                "fixes".to_string(),
                "resolves".to_string(),
                "done".to_string(),
                "completed".to_string(),
            ],
        }
    }
}

/// What to do with pending fires at scheduler shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownDrain {
    /// Return pending fires to the caller for serialization.
    Serialize,
    /// Drop pending fires.
    Drop,
}

/// Nudge scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NudgeConfig {
    /// Bound on pending fires.
    pub max_pending: usize,
    /// Delay applied when a fire is rescheduled after rate-limit denial.
    pub reschedule_delay_secs: u64,
    /// Shutdown policy for pending fires.
    pub shutdown_drain: ShutdownDrain,
}

impl Default for NudgeConfig {
    fn default() -> Self {
        Self {
            max_pending: 1024,
            reschedule_delay_secs: 300,
            shutdown_drain: ShutdownDrain::Serialize,
        }
    }
}

impl RateLimitConfig {
    /// Upper bound on `wait_until_admitted` as a `Duration`.
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }
}
