//! Trace record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::clock;

/// Unique trace record id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceId(pub String);

impl TraceId {
    /// Generate a fresh id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An append-only audit entry.
///
/// Records are never overwritten; retention deletes whole records only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    /// Record id
    pub id: TraceId,
    /// User the event belongs to
    pub user_id: String,
    /// Event type (cognitive_interaction, safety_override, anchor_mode, ...)
    pub event_type: String,
    /// Structured event payload
    pub event_data: Value,
    /// Correlated task, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// When the event happened
    pub timestamp: DateTime<Utc>,
    /// Producing component
    pub source: String,
    /// Confidence in [0, 1]
    pub confidence: f64,
}

impl TraceRecord {
    /// Create a record with full confidence, stamped now.
    pub fn new(
        user_id: impl Into<String>,
        event_type: impl Into<String>,
        event_data: Value,
    ) -> Self {
        Self {
            id: TraceId::generate(),
            user_id: user_id.into(),
            event_type: event_type.into(),
            event_data,
            task_id: None,
            timestamp: clock::wall_now(),
            source: "system".to_string(),
            confidence: 1.0,
        }
    }

    /// Set the producing component.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Correlate to a task.
    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Set the confidence, clamped to [0, 1].
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_builder_sets_fields() {
        let record = TraceRecord::new("u1", "cognitive_interaction", json!({"k": 1}))
            .with_source("cognitive_loop")
            .with_task("t-42")
            .with_confidence(0.8);

        assert_eq!(record.user_id, "u1");
        assert_eq!(record.event_type, "cognitive_interaction");
        assert_eq!(record.source, "cognitive_loop");
        assert_eq!(record.task_id.as_deref(), Some("t-42"));
        assert_eq!(record.confidence, 0.8);
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(TraceId::generate(), TraceId::generate());
    }
}
