//! Composition root and external surfaces.
//!
//! Components are wired here through their interfaces; nothing in the crate
//! reaches for a global. The runtime owns the admission edge (rate limiter
//! plus infrastructure breaker), maps loop outcomes onto the replies an
//! embedder may show, and drives the background workers (webhook automation,
//! nudge scheduler).

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::breaker::{Gate, InfraBreaker, PsychBreaker};
use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::frame::{ContextSource, FrameBuilder, FrameStore, InMemoryFrameStore, NudgeTier};
use crate::llm::{CloudModel, LlmResponse, ModelRouter};
use crate::nudge::{DeliveryOutcome, DrainedNudge, NudgeDelivery, NudgeScheduler};
use crate::notify::{LoggingNotifier, Notifier};
use crate::orchestrator::{CognitiveLoop, LoopOutcome, LoopReport};
use crate::ratelimit::{Admission, RateLimiter, RequestOutcome};
use crate::safety::SafetyMonitor;
use crate::trace::{InMemoryTraceStore, ProtectedTraceStore, TraceStore, WebhookEventLog};
use crate::webhook::{AutomationRequest, EventHeaders, WebhookOutcome, WebhookRouter};

/// Longest accepted message text.
const MAX_MESSAGE_CHARS: usize = 2000;

/// One inbound user message from the embedding surface.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// User the message belongs to
    pub user_id: String,
    /// Message text, at most 2000 characters
    pub text: String,
    /// Optional free-form context from the surface
    pub context: Option<HashMap<String, Value>>,
    /// Optional task focus
    pub task_focus: Option<String>,
    /// Emergency flag: force the highest-priority safety set and skip
    /// admission control
    pub emergency: bool,
}

impl InboundMessage {
    /// A plain message with no extras.
    pub fn new(user_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            text: text.into(),
            context: None,
            task_focus: None,
            emergency: false,
        }
    }

    /// Mark the message as an emergency.
    pub fn emergency(mut self) -> Self {
        self.emergency = true;
        self
    }

    /// Set the task focus.
    pub fn with_task_focus(mut self, task_focus: impl Into<String>) -> Self {
        self.task_focus = Some(task_focus.into());
        self
    }
}

/// What the embedding surface may show the user. Raw internal errors never
/// appear here.
#[derive(Debug, Clone)]
pub enum SurfaceReply {
    /// A normal pipeline response.
    Normal { response: LlmResponse },
    /// The minimal response served while the user's circuit is open.
    Anchor { response: LlmResponse },
    /// A deterministic safety response.
    Safety { response: LlmResponse },
    /// Admission was denied; retry after roughly this long.
    RetryAfter { retry_after: Duration },
    /// Something went wrong internally; ask the user to try again.
    TryAgain,
}

impl SurfaceReply {
    /// The reply text, when there is one.
    pub fn text(&self) -> Option<&str> {
        match self {
            SurfaceReply::Normal { response }
            | SurfaceReply::Anchor { response }
            | SurfaceReply::Safety { response } => Some(&response.text),
            SurfaceReply::RetryAfter { .. } | SurfaceReply::TryAgain => None,
        }
    }
}

fn reply_from_report(report: LoopReport) -> SurfaceReply {
    match report.outcome {
        LoopOutcome::Completed { response, .. } => SurfaceReply::Normal { response },
        LoopOutcome::SafetyOverride { response } => SurfaceReply::Safety { response },
        LoopOutcome::Anchor { response } => SurfaceReply::Anchor { response },
        LoopOutcome::Failed { .. } | LoopOutcome::Cancelled => SurfaceReply::TryAgain,
    }
}

/// Builder wiring the runtime's collaborators.
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    traces: Option<Arc<dyn TraceStore>>,
    event_log: Option<Arc<dyn WebhookEventLog>>,
    frames: Option<Arc<dyn FrameStore>>,
    cloud: Option<Arc<dyn CloudModel>>,
    notifier: Option<Arc<dyn Notifier>>,
    sources: Vec<Arc<dyn ContextSource>>,
}

impl RuntimeBuilder {
    /// Start from a configuration bundle.
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            traces: None,
            event_log: None,
            frames: None,
            cloud: None,
            notifier: None,
            sources: Vec::new(),
        }
    }

    /// Use a specific trace store (default: in-memory).
    pub fn with_trace_store(mut self, traces: Arc<dyn TraceStore>) -> Self {
        self.traces = Some(traces);
        self
    }

    /// Use a specific webhook event log (default: shares the in-memory
    /// trace backend).
    pub fn with_event_log(mut self, event_log: Arc<dyn WebhookEventLog>) -> Self {
        self.event_log = Some(event_log);
        self
    }

    /// Use a specific frame cache (default: in-memory).
    pub fn with_frame_store(mut self, frames: Arc<dyn FrameStore>) -> Self {
        self.frames = Some(frames);
        self
    }

    /// Attach a cloud model.
    pub fn with_cloud_model(mut self, cloud: Arc<dyn CloudModel>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    /// Attach a notifier (default: logging only).
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Register an optional context source for frame assembly.
    pub fn with_context_source(mut self, source: Arc<dyn ContextSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Wire everything together.
    pub fn build(self) -> Result<Runtime> {
        let config = self.config;

        let (raw_traces, default_event_log): (Arc<dyn TraceStore>, Arc<dyn WebhookEventLog>) =
            match self.traces {
                Some(traces) => {
                    let fallback = Arc::new(InMemoryTraceStore::new());
                    (traces, fallback)
                }
                None => {
                    let shared = Arc::new(InMemoryTraceStore::new());
                    (shared.clone(), shared)
                }
            };
        let event_log = self.event_log.unwrap_or(default_event_log);

        let store_breaker = Arc::new(InfraBreaker::new(
            "trace_store",
            config.infra_breaker.clone(),
        ));
        let traces: Arc<dyn TraceStore> = Arc::new(ProtectedTraceStore::new(
            raw_traces,
            Arc::clone(&store_breaker),
        ));

        let frames = self
            .frames
            .unwrap_or_else(|| Arc::new(InMemoryFrameStore::new()));

        let safety = Arc::new(SafetyMonitor::new(config.safety.clone())?);
        let breaker = Arc::new(PsychBreaker::new(config.psych_breaker.clone()));
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));

        let mut builder = FrameBuilder::new(config.frame.clone(), Arc::clone(&traces), frames);
        for source in self.sources {
            builder = builder.with_source(source);
        }
        let builder = Arc::new(builder);

        let router = Arc::new(ModelRouter::new(
            config.llm.clone(),
            Arc::clone(&safety),
            self.cloud,
        ));

        let cognitive_loop = Arc::new(CognitiveLoop::new(
            safety,
            breaker,
            builder,
            router,
            Arc::clone(&traces),
            config.psych_breaker.anchor_text.clone(),
        ));

        let (webhooks, automation_rx) = WebhookRouter::new(config.webhook.clone(), event_log);
        let scheduler = Arc::new(NudgeScheduler::new(config.nudge.clone()));
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(LoggingNotifier));

        Ok(Runtime {
            cognitive_loop,
            limiter,
            store_breaker,
            webhooks: Arc::new(webhooks),
            scheduler,
            notifier,
            automation_rx: Mutex::new(Some(automation_rx)),
            workers: Mutex::new(Vec::new()),
        })
    }
}

/// The assembled runtime.
pub struct Runtime {
    cognitive_loop: Arc<CognitiveLoop>,
    limiter: Arc<RateLimiter>,
    store_breaker: Arc<InfraBreaker>,
    webhooks: Arc<WebhookRouter>,
    scheduler: Arc<NudgeScheduler>,
    notifier: Arc<dyn Notifier>,
    automation_rx: Mutex<Option<mpsc::UnboundedReceiver<AutomationRequest>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct LoopNudgeDelivery {
    cognitive_loop: Arc<CognitiveLoop>,
    limiter: Arc<RateLimiter>,
    notifier: Arc<dyn Notifier>,
}

#[async_trait]
impl NudgeDelivery for LoopNudgeDelivery {
    async fn deliver(&self, user_id: &str, task_id: &str) -> DeliveryOutcome {
        if let Admission::RetryAfter(_) = self.limiter.admit(Some("nudge")) {
            return DeliveryOutcome::RateLimited;
        }

        let report = self.cognitive_loop.initiate_proactive(user_id, task_id).await;
        self.limiter.record(
            Some("nudge"),
            if report.is_success() {
                RequestOutcome::Success
            } else {
                RequestOutcome::Failed
            },
        );

        match report.response() {
            Some(response) => {
                let sent = self
                    .notifier
                    .send(user_id, "nudge", &response.text, NudgeTier::Gentle)
                    .await;
                if !sent {
                    warn!(user_id, task_id, "nudge notification failed");
                }
                DeliveryOutcome::Delivered
            }
            None => DeliveryOutcome::Failed,
        }
    }
}

impl Runtime {
    /// Builder over a configuration bundle.
    pub fn builder(config: RuntimeConfig) -> RuntimeBuilder {
        RuntimeBuilder::new(config)
    }

    /// The cognitive loop.
    pub fn cognitive_loop(&self) -> &Arc<CognitiveLoop> {
        &self.cognitive_loop
    }

    /// The rate limiter guarding admission.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// The breaker guarding the trace store.
    pub fn store_breaker(&self) -> &InfraBreaker {
        &self.store_breaker
    }

    /// The webhook router, for handler registration.
    pub fn webhooks(&self) -> &Arc<WebhookRouter> {
        &self.webhooks
    }

    /// The nudge scheduler.
    pub fn scheduler(&self) -> &Arc<NudgeScheduler> {
        &self.scheduler
    }

    /// Spawn the background workers: the automation drain feeding webhook
    /// triggers into the loop, and the nudge scheduler driver.
    pub fn start(&self) {
        let mut workers = self.workers.lock().unwrap_or_else(|p| p.into_inner());

        if let Some(mut automation_rx) = self
            .automation_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            let cognitive_loop = Arc::clone(&self.cognitive_loop);
            workers.push(tokio::spawn(async move {
                while let Some(request) = automation_rx.recv().await {
                    let task_id = request
                        .task_id
                        .clone()
                        .unwrap_or_else(|| request.reason.clone());
                    info!(
                        user_id = %request.user_id,
                        task_id = %task_id,
                        reason = %request.reason,
                        "automation trigger"
                    );
                    cognitive_loop
                        .initiate_proactive(&request.user_id, &task_id)
                        .await;
                }
            }));
        }

        let delivery = LoopNudgeDelivery {
            cognitive_loop: Arc::clone(&self.cognitive_loop),
            limiter: Arc::clone(&self.limiter),
            notifier: Arc::clone(&self.notifier),
        };
        let scheduler = Arc::clone(&self.scheduler);
        workers.push(tokio::spawn(async move {
            scheduler.run(&delivery).await;
        }));
    }

    /// Stop the workers and drain pending nudges per configuration.
    pub async fn shutdown(&self) -> Vec<DrainedNudge> {
        let drained = self.scheduler.shutdown();
        let workers: Vec<JoinHandle<()>> = {
            let mut guard = self.workers.lock().unwrap_or_else(|p| p.into_inner());
            guard.drain(..).collect()
        };
        for worker in workers {
            worker.abort();
            let _ = worker.await;
        }
        drained
    }

    fn validate(message: &InboundMessage) -> Result<()> {
        if message.user_id.trim().is_empty() {
            return Err(Error::invalid_input("user id must not be empty"));
        }
        if message.text.trim().is_empty() {
            return Err(Error::invalid_input("message text must not be empty"));
        }
        if message.text.chars().count() > MAX_MESSAGE_CHARS {
            return Err(Error::invalid_input(format!(
                "message text exceeds {} characters",
                MAX_MESSAGE_CHARS
            )));
        }
        Ok(())
    }

    /// Handle one inbound user message.
    ///
    /// Validation failures surface synchronously as errors; everything else
    /// becomes one of the fixed reply shapes. Emergencies skip admission
    /// control entirely.
    pub async fn handle_message(&self, message: InboundMessage) -> Result<SurfaceReply> {
        Self::validate(&message)?;

        if message.emergency {
            let report = self
                .cognitive_loop
                .process_emergency(&message.user_id, &message.text)
                .await;
            return Ok(reply_from_report(report));
        }

        if self.store_breaker.check() == Gate::Deny {
            return Ok(SurfaceReply::RetryAfter {
                retry_after: Duration::from_secs(30),
            });
        }

        if let Admission::RetryAfter(retry_after) = self.limiter.admit(Some("chat")) {
            return Ok(SurfaceReply::RetryAfter { retry_after });
        }

        let report = self
            .cognitive_loop
            .process(
                &message.user_id,
                &message.text,
                message.task_focus.as_deref(),
                NudgeTier::Gentle,
            )
            .await;

        self.limiter.record(
            Some("chat"),
            if report.is_success() {
                RequestOutcome::Success
            } else {
                RequestOutcome::Failed
            },
        );

        Ok(reply_from_report(report))
    }

    /// Handle one inbound webhook delivery.
    pub async fn handle_webhook(
        &self,
        raw_body: &[u8],
        headers: EventHeaders,
    ) -> WebhookOutcome {
        if let Admission::RetryAfter(retry_after) = self.limiter.admit(Some("webhook")) {
            return WebhookOutcome::RateLimited { retry_after };
        }
        let outcome = self.webhooks.process(raw_body, headers).await;
        self.limiter.record(
            Some("webhook"),
            if outcome.is_accepted() {
                RequestOutcome::Success
            } else {
                RequestOutcome::Failed
            },
        );
        outcome
    }
}
