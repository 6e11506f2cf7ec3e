//! Webhook event types and processing outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::clock;

/// A normalized inbound webhook event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// Unique delivery id, the dedup key
    pub delivery_id: String,
    /// Event type (issues, push, pull_request, ...)
    pub event_type: String,
    /// Action subtype, when the provider sends one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Repository or source identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
    /// Raw payload
    pub payload: Value,
    /// When the event arrived
    pub received_at: DateTime<Utc>,
    /// Whether dispatch completed
    pub processed: bool,
    /// Total processing duration
    pub processing_time_ms: f64,
    /// How many automation invocations the event queued
    pub triggered_actions: u32,
}

impl WebhookEvent {
    /// Create an unprocessed event stamped now.
    pub fn new(
        delivery_id: impl Into<String>,
        event_type: impl Into<String>,
        action: Option<&str>,
        payload: Value,
    ) -> Self {
        let source_ref = payload
            .get("repository")
            .and_then(|repo| repo.get("full_name"))
            .and_then(Value::as_str)
            .map(str::to_string);

        Self {
            delivery_id: delivery_id.into(),
            event_type: event_type.into(),
            action: action.map(str::to_string),
            source_ref,
            payload,
            received_at: clock::wall_now(),
            processed: false,
            processing_time_ms: 0.0,
            triggered_actions: 0,
        }
    }
}

/// Normalized headers of an inbound delivery.
#[derive(Debug, Clone, Default)]
pub struct EventHeaders {
    /// Unique delivery id
    pub delivery_id: String,
    /// Event type
    pub event_type: String,
    /// Action subtype
    pub action: Option<String>,
    /// Provided signature (`sha256=<hex>`), if any
    pub signature: Option<String>,
}

/// Result of processing one delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    /// Verified, dispatched, and recorded.
    Processed {
        delivery_id: String,
        handlers_executed: u32,
        handler_failures: u32,
        triggered_actions: u32,
        processing_time_ms: f64,
    },
    /// The delivery id was seen inside the dedup window; nothing ran.
    AlreadyProcessed { delivery_id: String },
    /// Signature verification failed; nothing ran.
    Unauthorized,
    /// The body did not parse; nothing ran.
    Malformed { reason: String },
    /// Admission was denied; retry later.
    RateLimited { retry_after: Duration },
}

impl WebhookOutcome {
    /// Whether the event was accepted (processed or deduplicated).
    pub fn is_accepted(&self) -> bool {
        matches!(
            self,
            WebhookOutcome::Processed { .. } | WebhookOutcome::AlreadyProcessed { .. }
        )
    }
}
