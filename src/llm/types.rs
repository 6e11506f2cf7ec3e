//! Model response types.

use serde::{Deserialize, Serialize};

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    /// O(1) canned-intent table hit
    PatternMatch,
    /// Local response cache hit (or the canned degraded fallback)
    LocalCached,
    /// Cloud model completion
    Cloud,
    /// Deterministic safety override
    HardCoded,
    /// Minimal response served while the user's circuit is open
    AnchorMode,
}

impl std::fmt::Display for ResponseSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PatternMatch => write!(f, "pattern_match"),
            Self::LocalCached => write!(f, "local_cached"),
            Self::Cloud => write!(f, "cloud"),
            Self::HardCoded => write!(f, "hard_coded"),
            Self::AnchorMode => write!(f, "anchor_mode"),
        }
    }
}

/// A produced response. Immutable after production.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    /// Response text
    pub text: String,
    /// Producing tier
    pub source: ResponseSource,
    /// Confidence in [0, 1]
    pub confidence: f64,
    /// Model identifier (or producing component for non-model tiers)
    pub model: String,
    /// Production latency in milliseconds
    pub latency_ms: u64,
}

/// Raw completion coming back from a cloud model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudCompletion {
    /// Completed text
    pub text: String,
    /// Model that produced it
    pub model: String,
}
