//! Priority-ordered webhook dispatch.
//!
//! Pipeline per delivery: verify signature, dedup on delivery id, persist
//! the event, run matching handlers in priority order, queue automation
//! triggers, update statistics. Handler failures are isolated; signature and
//! parse failures abort with no side effects.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::clock;
use crate::config::WebhookConfig;
use crate::error::Result;
use crate::metrics::WebhookStats;
use crate::trace::WebhookEventLog;
use crate::webhook::signature;
use crate::webhook::types::{EventHeaders, WebhookEvent, WebhookOutcome};

/// A registered event handler.
#[async_trait]
pub trait WebhookHandler: Send + Sync {
    /// Handler name, for logs and dispatch records.
    fn name(&self) -> &str;

    /// Handle one event. Must respect cancellation at suspension points;
    /// the router enforces a timeout around the call.
    async fn handle(&self, event: &WebhookEvent) -> Result<()>;
}

struct HandlerRegistration {
    event_type: String,
    action: Option<String>,
    priority: i32,
    enabled: bool,
    seq: usize,
    handler: Arc<dyn WebhookHandler>,
}

/// A synthetic loop invocation queued by an automation trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct AutomationRequest {
    /// User the invocation belongs to
    pub user_id: String,
    /// Correlated task or work item, when derivable
    pub task_id: Option<String>,
    /// Why the invocation was queued
    pub reason: String,
}

struct DedupCache {
    window: Duration,
    capacity: usize,
    seen: HashMap<String, Instant>,
    order: VecDeque<String>,
}

impl DedupCache {
    fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity,
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns true when the id was already seen inside the window, and
    /// marks it seen otherwise.
    fn check_and_insert(&mut self, delivery_id: &str) -> bool {
        let now = clock::now();

        if let Some(&seen_at) = self.seen.get(delivery_id) {
            if now.duration_since(seen_at) < self.window {
                return true;
            }
        }

        self.seen.insert(delivery_id.to_string(), now);
        self.order.push_back(delivery_id.to_string());
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        false
    }
}

/// Priority dispatch router for inbound webhook events.
pub struct WebhookRouter {
    config: WebhookConfig,
    handlers: Mutex<Vec<HandlerRegistration>>,
    next_seq: Mutex<usize>,
    dedup: Mutex<DedupCache>,
    event_log: Arc<dyn WebhookEventLog>,
    automation: mpsc::UnboundedSender<AutomationRequest>,
    stats: Arc<WebhookStats>,
}

impl WebhookRouter {
    /// Create a router. Automation triggers flow out of the returned
    /// receiver; the composition root drains it into the cognitive loop.
    pub fn new(
        config: WebhookConfig,
        event_log: Arc<dyn WebhookEventLog>,
    ) -> (Self, mpsc::UnboundedReceiver<AutomationRequest>) {
        let (automation, automation_rx) = mpsc::unbounded_channel();
        let dedup = DedupCache::new(
            Duration::from_secs(config.dedup_window_secs),
            config.dedup_capacity,
        );
        let router = Self {
            config,
            handlers: Mutex::new(Vec::new()),
            next_seq: Mutex::new(0),
            dedup: Mutex::new(dedup),
            event_log,
            automation,
            stats: Arc::new(WebhookStats::new()),
        };
        (router, automation_rx)
    }

    /// Register a handler for `(event_type, action)`. A `None` action
    /// matches every action of the event type. Higher priority dispatches
    /// first; ties dispatch in registration order.
    pub fn register(
        &self,
        event_type: impl Into<String>,
        action: Option<&str>,
        priority: i32,
        handler: Arc<dyn WebhookHandler>,
    ) {
        let seq = {
            let mut next = self.next_seq.lock().unwrap_or_else(|p| p.into_inner());
            let seq = *next;
            *next += 1;
            seq
        };
        let registration = HandlerRegistration {
            event_type: event_type.into(),
            action: action.map(str::to_string),
            priority,
            enabled: true,
            seq,
            handler,
        };
        info!(
            event_type = %registration.event_type,
            action = ?registration.action,
            priority,
            "webhook handler registered"
        );
        self.handlers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(registration);
    }

    /// Enable or disable a registered handler by name.
    pub fn set_enabled(&self, name: &str, enabled: bool) {
        let mut handlers = self.handlers.lock().unwrap_or_else(|p| p.into_inner());
        for registration in handlers.iter_mut() {
            if registration.handler.name() == name {
                registration.enabled = enabled;
            }
        }
    }

    /// Router statistics.
    pub fn stats(&self) -> &WebhookStats {
        &self.stats
    }

    /// Process one raw delivery.
    pub async fn process(&self, raw_body: &[u8], headers: EventHeaders) -> WebhookOutcome {
        let started = clock::now();
        self.stats.record_received();

        // Step 1: signature verification over the exact raw bytes
        if let Some(secret) = &self.config.secret {
            let valid = headers
                .signature
                .as_deref()
                .map(|provided| signature::verify(secret, raw_body, provided))
                .unwrap_or(false);
            if !valid {
                warn!(delivery_id = %headers.delivery_id, "invalid webhook signature");
                self.stats.record_invalid_signature();
                return WebhookOutcome::Unauthorized;
            }
        }

        // Parse failure is fatal for the request, with no side effects
        let payload: Value = match serde_json::from_slice(raw_body) {
            Ok(payload) => payload,
            Err(e) => {
                return WebhookOutcome::Malformed {
                    reason: e.to_string(),
                }
            }
        };

        // Step 2: dedup on the delivery id
        {
            let mut dedup = self.dedup.lock().unwrap_or_else(|p| p.into_inner());
            if dedup.check_and_insert(&headers.delivery_id) {
                debug!(delivery_id = %headers.delivery_id, "duplicate delivery");
                self.stats.record_duplicate();
                return WebhookOutcome::AlreadyProcessed {
                    delivery_id: headers.delivery_id,
                };
            }
        }

        // Step 3: persist the event; a log failure is not fatal for dispatch
        let event = WebhookEvent::new(
            headers.delivery_id.clone(),
            headers.event_type.clone(),
            headers.action.as_deref(),
            payload,
        );
        if let Err(error) = self.event_log.record_event(&event).await {
            warn!(%error, delivery_id = %event.delivery_id, "failed to persist webhook event");
        }

        // Step 4: dispatch in priority order, sequentially, isolated
        let (handlers_executed, handler_failures) = self.dispatch(&event).await;

        // Step 5: automation triggers, non-blocking
        let triggered_actions = self.trigger_automation(&event);

        // Step 6: statistics and event completion
        let processing_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        if let Err(error) = self
            .event_log
            .mark_processed(&event.delivery_id, processing_time_ms, triggered_actions)
            .await
        {
            warn!(%error, delivery_id = %event.delivery_id, "failed to finalize webhook event");
        }
        self.stats.record_accepted();
        self.stats.record_processing_time(processing_time_ms);

        info!(
            delivery_id = %event.delivery_id,
            handlers_executed,
            triggered_actions,
            "webhook processed"
        );

        WebhookOutcome::Processed {
            delivery_id: event.delivery_id,
            handlers_executed,
            handler_failures,
            triggered_actions,
            processing_time_ms,
        }
    }

    async fn dispatch(&self, event: &WebhookEvent) -> (u32, u32) {
        let matching: Vec<(i32, usize, Arc<dyn WebhookHandler>)> = {
            let handlers = self.handlers.lock().unwrap_or_else(|p| p.into_inner());
            let mut matching: Vec<_> = handlers
                .iter()
                .filter(|registration| {
                    registration.enabled
                        && registration.event_type == event.event_type
                        && registration
                            .action
                            .as_deref()
                            .map(|action| Some(action) == event.action.as_deref())
                            .unwrap_or(true)
                })
                .map(|registration| {
                    (
                        registration.priority,
                        registration.seq,
                        Arc::clone(&registration.handler),
                    )
                })
                .collect();
            matching.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
            matching
        };

        let timeout = Duration::from_secs(self.config.handler_timeout_secs);
        let mut executed = 0u32;
        let mut failures = 0u32;

        for (_, _, handler) in matching {
            match tokio::time::timeout(timeout, handler.handle(event)).await {
                Ok(Ok(())) => executed += 1,
                Ok(Err(error)) => {
                    warn!(handler = handler.name(), %error, "webhook handler failed");
                    self.stats.record_handler_failure();
                    failures += 1;
                }
                Err(_) => {
                    warn!(handler = handler.name(), "webhook handler timed out");
                    self.stats.record_handler_failure();
                    failures += 1;
                }
            }
        }

        (executed, failures)
    }

    fn automation_user(payload: &Value) -> Option<String> {
        payload
            .get("user_id")
            .and_then(Value::as_str)
            .or_else(|| {
                payload
                    .get("sender")
                    .and_then(|sender| sender.get("login"))
                    .and_then(Value::as_str)
            })
            .map(str::to_string)
    }

    fn push_has_completion_keyword(&self, payload: &Value) -> bool {
        let Some(commits) = payload.get("commits").and_then(Value::as_array) else {
            return false;
        };
        commits.iter().any(|commit| {
            commit
                .get("message")
                .and_then(Value::as_str)
                .map(|message| {
                    let message = message.to_lowercase();
                    self.config
                        .completion_keywords
                        .iter()
                        .any(|keyword| message.contains(keyword.as_str()))
                })
                .unwrap_or(false)
        })
    }

    fn trigger_automation(&self, event: &WebhookEvent) -> u32 {
        let action = event.action.as_deref();
        let reason = match (event.event_type.as_str(), action) {
            ("issues", Some("opened")) | ("issues", Some("edited")) | ("issues", Some("labeled")) => {
                Some(format!("issue_{}", action.unwrap_or_default()))
            }
            ("push", _) if self.push_has_completion_keyword(&event.payload) => {
                Some("push_completion".to_string())
            }
            ("pull_request", Some("closed"))
                if event
                    .payload
                    .get("pull_request")
                    .and_then(|pr| pr.get("merged"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false) =>
            {
                Some("pr_merged".to_string())
            }
            _ => None,
        };

        let Some(reason) = reason else {
            return 0;
        };
        let Some(user_id) = Self::automation_user(&event.payload) else {
            debug!(delivery_id = %event.delivery_id, "automation trigger without a user");
            return 0;
        };

        let task_id = event
            .payload
            .get("issue")
            .and_then(|issue| issue.get("number"))
            .and_then(Value::as_u64)
            .map(|n| format!("issue-{}", n));

        let request = AutomationRequest {
            user_id,
            task_id,
            reason,
        };

        // Unbounded send never blocks; a closed receiver only means the
        // runtime is shutting down.
        if self.automation.send(request).is_err() {
            warn!(delivery_id = %event.delivery_id, "automation queue closed");
            return 0;
        }
        self.stats.record_automation_trigger();
        1
    }
}
