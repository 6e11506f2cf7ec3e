//! The cognitive loop.
//!
//! One `process` call runs the whole pipeline: safety screen, circuit
//! breaker gate, frame assembly, tiered routing, then a concurrent fan-out
//! of post-response work (action derivation, trace write, breaker update)
//! with all-settled semantics. Proactive nudges re-enter the same pipeline,
//! so every path gets the same safety and breaker properties.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::breaker::{PsychBreaker, PsychGate};
use crate::clock;
use crate::frame::{ContextualFrame, FrameBuilder, NudgeTier};
use crate::llm::{LlmResponse, ModelRouter, ResponseSource};
use crate::metrics::LoopStats;
use crate::safety::{SafetyMonitor, SafetyVerdict};
use crate::trace::{TraceRecord, TraceStore};

/// Agent id stamped on frames built for direct user input.
const MAIN_AGENT: &str = "main_cognitive_loop";
/// Agent id stamped on frames built for proactive nudges.
const PROACTIVE_AGENT: &str = "proactive_nudge_system";

/// How one loop invocation ended. Each variant carries exactly the fields
/// its interpretation needs.
#[derive(Debug, Clone)]
pub enum LoopOutcome {
    /// A normal response with its frame and executed follow-ups.
    Completed {
        response: LlmResponse,
        frame: ContextualFrame,
        actions_taken: Vec<String>,
    },
    /// A deterministic safety override; only the trace write ran.
    SafetyOverride { response: LlmResponse },
    /// The user's circuit is open; a minimal anchor response was served.
    Anchor { response: LlmResponse },
    /// An internal error; the breaker was fed the failure.
    Failed { error: String },
    /// The caller's deadline fired; no breaker update.
    Cancelled,
}

/// Result of one loop invocation.
#[derive(Debug, Clone)]
pub struct LoopReport {
    /// How the invocation ended
    pub outcome: LoopOutcome,
    /// Wall time spent in the loop
    pub processing_time_ms: f64,
}

impl LoopReport {
    /// Whether the invocation produced a response for the user.
    pub fn is_success(&self) -> bool {
        matches!(
            self.outcome,
            LoopOutcome::Completed { .. }
                | LoopOutcome::SafetyOverride { .. }
                | LoopOutcome::Anchor { .. }
        )
    }

    /// The produced response, if any.
    pub fn response(&self) -> Option<&LlmResponse> {
        match &self.outcome {
            LoopOutcome::Completed { response, .. }
            | LoopOutcome::SafetyOverride { response }
            | LoopOutcome::Anchor { response } => Some(response),
            LoopOutcome::Failed { .. } | LoopOutcome::Cancelled => None,
        }
    }

    /// Cognitive load of the interaction.
    pub fn cognitive_load(&self) -> f64 {
        match &self.outcome {
            LoopOutcome::Completed { frame, .. } => frame.cognitive_load,
            LoopOutcome::Anchor { .. } => 0.1,
            _ => 0.0,
        }
    }

    /// Actions the loop took alongside the response.
    pub fn actions_taken(&self) -> Vec<String> {
        match &self.outcome {
            LoopOutcome::Completed { actions_taken, .. } => actions_taken.clone(),
            LoopOutcome::SafetyOverride { .. } => vec!["safety_override".to_string()],
            LoopOutcome::Anchor { .. } => vec!["anchor_mode".to_string()],
            _ => Vec::new(),
        }
    }

    /// Error message of a failed invocation.
    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            LoopOutcome::Failed { error } => Some(error),
            _ => None,
        }
    }
}

/// The central orchestrator.
pub struct CognitiveLoop {
    safety: Arc<SafetyMonitor>,
    breaker: Arc<PsychBreaker>,
    builder: Arc<FrameBuilder>,
    router: Arc<ModelRouter>,
    traces: Arc<dyn TraceStore>,
    stats: Arc<LoopStats>,
    anchor_text: String,
}

impl CognitiveLoop {
    /// Wire a loop from its collaborators.
    pub fn new(
        safety: Arc<SafetyMonitor>,
        breaker: Arc<PsychBreaker>,
        builder: Arc<FrameBuilder>,
        router: Arc<ModelRouter>,
        traces: Arc<dyn TraceStore>,
        anchor_text: impl Into<String>,
    ) -> Self {
        Self {
            safety,
            breaker,
            builder,
            router,
            traces,
            stats: Arc::new(LoopStats::new()),
            anchor_text: anchor_text.into(),
        }
    }

    /// Loop counters.
    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    /// The per-user breaker this loop consults.
    pub fn breaker(&self) -> &PsychBreaker {
        &self.breaker
    }

    fn elapsed_ms(started: tokio::time::Instant) -> f64 {
        started.elapsed().as_secs_f64() * 1000.0
    }

    /// Flush a safety-override trace on a detached task. Once a safety
    /// response is produced it is recorded even if the caller has gone away.
    fn flush_safety_trace(&self, user_id: &str, user_input: &str, response: &LlmResponse) {
        let traces = Arc::clone(&self.traces);
        let record = TraceRecord::new(
            user_id,
            "safety_override",
            json!({
                "trigger_input": user_input,
                "safety_response": response.text,
                "response_source": response.source.to_string(),
            }),
        )
        .with_source("safety_monitor");

        tokio::spawn(async move {
            if let Err(error) = traces.append(record).await {
                error!(%error, "failed to record safety override trace");
            }
        });
    }

    fn safety_report(
        &self,
        user_id: &str,
        user_input: &str,
        response: LlmResponse,
        started: tokio::time::Instant,
    ) -> LoopReport {
        self.stats.record_safety_override();
        self.flush_safety_trace(user_id, user_input, &response);
        LoopReport {
            outcome: LoopOutcome::SafetyOverride { response },
            processing_time_ms: Self::elapsed_ms(started),
        }
    }

    async fn anchor_report(&self, user_id: &str, started: tokio::time::Instant) -> LoopReport {
        info!(user_id, "circuit breaker open, anchor mode");
        self.stats.record_anchor();

        let response = LlmResponse {
            text: self.anchor_text.clone(),
            source: ResponseSource::AnchorMode,
            confidence: 1.0,
            model: "circuit_breaker".to_string(),
            latency_ms: 0,
        };

        let record = TraceRecord::new(user_id, "anchor_mode", json!({ "text": response.text }))
            .with_source("cognitive_loop");
        if let Err(error) = self.traces.append(record).await {
            warn!(%error, "failed to record anchor trace");
        }

        LoopReport {
            outcome: LoopOutcome::Anchor { response },
            processing_time_ms: Self::elapsed_ms(started),
        }
    }

    async fn failure_report(
        &self,
        user_id: &str,
        message: String,
        started: tokio::time::Instant,
    ) -> LoopReport {
        error!(user_id, error = %message, "cognitive loop failed");

        if self.breaker.record(user_id, false) {
            self.stats.record_trip();
        }
        self.stats.record_failure();

        let record = TraceRecord::new(user_id, "loop_error", json!({ "error": message }))
            .with_source("cognitive_loop");
        if let Err(error) = self.traces.append(record).await {
            warn!(%error, "failed to record error trace");
        }

        LoopReport {
            outcome: LoopOutcome::Failed { error: message },
            processing_time_ms: Self::elapsed_ms(started),
        }
    }

    fn derive_actions(frame: &ContextualFrame) -> Vec<String> {
        use crate::frame::RecommendedAction;

        let mut actions_taken = Vec::new();
        if frame.cognitive_load > 0.8 {
            actions_taken.push("cognitive_load_warning".to_string());
        }
        if frame.accessibility_score < 0.5 {
            actions_taken.push("accessibility_adjustment".to_string());
        }
        match frame.recommended_action {
            RecommendedAction::SimplifyContext => {
                actions_taken.push("context_simplification".to_string())
            }
            RecommendedAction::ClarifyFocus => {
                actions_taken.push("focus_clarification".to_string())
            }
            RecommendedAction::None => {}
        }
        actions_taken
    }

    /// Process one user input through the full pipeline.
    pub async fn process(
        &self,
        user_id: &str,
        user_input: &str,
        task_focus: Option<&str>,
        nudge_tier: NudgeTier,
    ) -> LoopReport {
        let started = clock::now();
        self.stats.record_request();

        // Safety screens the raw input before anything else, so a crisis
        // message is answered even while the circuit is open.
        if let SafetyVerdict::Override { response, .. } = self.safety.evaluate(user_input, None) {
            return self.safety_report(user_id, user_input, response, started);
        }

        if self.breaker.gate(user_id) == PsychGate::Anchor {
            return self.anchor_report(user_id, started).await;
        }

        let frame = match self
            .builder
            .build(user_id, MAIN_AGENT, task_focus, true)
            .await
        {
            Ok(frame) => frame,
            Err(error) => {
                return self
                    .failure_report(user_id, format!("frame build failed: {}", error), started)
                    .await
            }
        };

        let response = match self.router.process(user_input, &frame, nudge_tier).await {
            Ok(response) => response,
            Err(error) => {
                return self
                    .failure_report(user_id, format!("routing failed: {}", error), started)
                    .await
            }
        };

        // The router re-screens with frame context; a hard-coded response
        // from either screen skips the fan-out except for its trace.
        if response.source == ResponseSource::HardCoded {
            return self.safety_report(user_id, user_input, response, started);
        }

        // Fan out: action derivation, trace write, breaker update. All three
        // proceed concurrently and all are awaited; one failing never stops
        // the others.
        let actions_future = async { Self::derive_actions(&frame) };
        let trace_future = async {
            let record = TraceRecord::new(
                user_id,
                "cognitive_interaction",
                json!({
                    "user_input": user_input,
                    "llm_response": response.text,
                    "llm_source": response.source.to_string(),
                    "cognitive_load": frame.cognitive_load,
                    "accessibility_score": frame.accessibility_score,
                    "processing_latency": response.latency_ms,
                    "task_focus": frame.frame.task_focus,
                }),
            )
            .with_source("cognitive_loop")
            .with_confidence(response.confidence);
            self.traces.append(record).await
        };
        let breaker_future = async { self.breaker.record(user_id, true) };

        let (mut actions_taken, trace_result, _) =
            tokio::join!(actions_future, trace_future, breaker_future);

        if let Err(error) = trace_result {
            warn!(%error, "trace write failed during fan-out");
            actions_taken.push("trace_write_failed".to_string());
        }

        self.stats.record_success();

        LoopReport {
            outcome: LoopOutcome::Completed {
                response,
                frame,
                actions_taken,
            },
            processing_time_ms: Self::elapsed_ms(started),
        }
    }

    /// Process with a deadline. When the deadline fires the loop is
    /// cancelled at its next suspension point and the caller gets a
    /// `Cancelled` outcome, distinct from an error: no breaker update, no
    /// failure trace. A safety override produced before the deadline is
    /// still flushed.
    pub async fn process_with_deadline(
        &self,
        user_id: &str,
        user_input: &str,
        task_focus: Option<&str>,
        nudge_tier: NudgeTier,
        deadline: Duration,
    ) -> LoopReport {
        let started = clock::now();
        match tokio::time::timeout(
            deadline,
            self.process(user_id, user_input, task_focus, nudge_tier),
        )
        .await
        {
            Ok(report) => report,
            Err(_) => {
                warn!(user_id, "cognitive loop cancelled at deadline");
                self.stats.record_cancelled();
                LoopReport {
                    outcome: LoopOutcome::Cancelled,
                    processing_time_ms: Self::elapsed_ms(started),
                }
            }
        }
    }

    /// Emergency entry point: the input goes straight through the
    /// highest-priority safety set, ignoring rate limits and both breakers.
    /// Anchor mode never applies here; a rule miss still yields the
    /// emergency response, and the override is traced like any other.
    pub async fn process_emergency(&self, user_id: &str, user_input: &str) -> LoopReport {
        let started = clock::now();
        self.stats.record_request();

        match self.safety.evaluate_emergency(user_input) {
            SafetyVerdict::Override { response, .. } => {
                self.safety_report(user_id, user_input, response, started)
            }
            // The emergency evaluation always overrides; falling through to
            // the ordinary pipeline keeps a logic bug from going silent.
            SafetyVerdict::Proceed => {
                self.process(user_id, user_input, None, NudgeTier::Gentle).await
            }
        }
    }

    fn synthesize_nudge_prompt(task_id: &str, frame: &ContextualFrame) -> String {
        let state = frame
            .frame
            .current_user_state()
            .and_then(|data| data.get("current_state"))
            .and_then(|value| value.as_str())
            .unwrap_or("unknown");

        match state {
            "low" => format!("Gentle check-in about {} when you're ready", task_id),
            "energized" => format!("You seem energized! Good time to tackle {}?", task_id),
            _ => format!("Friendly reminder about {}", task_id),
        }
    }

    /// Proactive entry point: synthesize a pseudo-user-input from the task
    /// and current frame, then traverse the ordinary pipeline with a gentle
    /// tier. There is no alternative pipeline.
    pub async fn initiate_proactive(&self, user_id: &str, task_id: &str) -> LoopReport {
        let started = clock::now();

        let frame = match self
            .builder
            .build(
                user_id,
                PROACTIVE_AGENT,
                Some(&format!("Task reminder: {}", task_id)),
                true,
            )
            .await
        {
            Ok(frame) => frame,
            Err(error) => {
                error!(user_id, task_id, %error, "proactive frame build failed");
                self.stats.record_failure();
                return LoopReport {
                    outcome: LoopOutcome::Failed {
                        error: format!("proactive nudge failed: {}", error),
                    },
                    processing_time_ms: Self::elapsed_ms(started),
                };
            }
        };

        let prompt = Self::synthesize_nudge_prompt(task_id, &frame);
        self.process(
            user_id,
            &prompt,
            Some(&format!("Proactive nudge for {}", task_id)),
            NudgeTier::Gentle,
        )
        .await
    }
}
