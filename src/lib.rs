//! # mcl-core
//!
//! A unified MCL (Meta-Cognitive Loop) orchestration runtime that mediates
//! between a user and one or more language-model backends.
//!
//! ## Core Components
//!
//! - **Frame**: contextual frame assembly with derived load scores
//! - **Safety**: deterministic hard-coded overrides, consulted before any model
//! - **Breaker**: per-user psychological and per-dependency infrastructure circuits
//! - **RateLimit**: multi-window admission with adaptive throttling
//! - **Orchestrator**: the cognitive loop tying it all together
//! - **Webhook**: priority-ordered inbound event dispatch
//! - **Nudge**: time-triggered proactive reinjection into the loop
//!
//! ## Example
//!
//! ```rust,ignore
//! use mcl_core::{InboundMessage, Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::builder(RuntimeConfig::default()).build()?;
//! runtime.start();
//!
//! let reply = runtime
//!     .handle_message(InboundMessage::new("u1", "I need to finish my report"))
//!     .await?;
//! if let Some(text) = reply.text() {
//!     println!("{}", text);
//! }
//! ```

pub mod breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod frame;
pub mod llm;
pub mod metrics;
pub mod notify;
pub mod nudge;
pub mod orchestrator;
pub mod ratelimit;
pub mod runtime;
pub mod safety;
pub mod trace;
pub mod webhook;

// Re-exports for convenience
pub use breaker::{
    BreakerState, Gate, InfraBreaker, InfraCircuitState, PsychBreaker, PsychGate,
    UserStateSnapshot,
};
pub use config::{
    FrameConfig, InfraBreakerConfig, LlmConfig, NudgeConfig, PsychBreakerConfig,
    RateLimitConfig, RuntimeConfig, SafetyConfig, SafetyRuleConfig, SafetySeverity,
    ShutdownDrain, WebhookConfig,
};
pub use error::{Error, Result};
pub use frame::{
    ContextItem, ContextKind, ContextSource, ContextualFrame, Frame, FrameBuilder, FrameKey,
    FrameStore, InMemoryFrameStore, NudgeTier, ProposedAction, RecommendedAction,
};
pub use llm::{
    CloudClientConfig, CloudCompletion, CloudModel, HttpCloudModel, LlmResponse, ModelRouter,
    ResponseSource,
};
pub use metrics::{LoopStats, LoopStatsSnapshot, WebhookStats, WebhookStatsSnapshot};
pub use notify::{LoggingNotifier, Notifier};
pub use nudge::{DeliveryOutcome, DrainedNudge, NudgeDelivery, NudgeId, NudgeScheduler};
pub use orchestrator::{CognitiveLoop, LoopOutcome, LoopReport};
pub use ratelimit::{
    Admission, RateLimiter, RateLimiterStats, RateLimiterStatus, RateLimitWindow, RequestOutcome,
    UpstreamQuota,
};
pub use runtime::{InboundMessage, Runtime, RuntimeBuilder, SurfaceReply};
pub use safety::{SafetyMonitor, SafetyVerdict};
pub use trace::{
    InMemoryTraceStore, ProtectedTraceStore, SqliteTraceStore, TraceId, TraceRecord, TraceStore,
    WebhookEventLog,
};
pub use webhook::{
    AutomationRequest, EventHeaders, WebhookEvent, WebhookHandler, WebhookOutcome, WebhookRouter,
};
