//! Core frame types: ContextItem, Frame, ContextualFrame.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::clock;

/// The kind of a context item inside a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    /// A recalled trace of a past interaction
    MemoryTrace,
    /// An upcoming or recent calendar event
    CalendarEvent,
    /// The user's current energy/mood state
    UserState,
    /// Ambient environment signal (location, device, time of day)
    Environment,
    /// The task in focus
    Task,
    /// A recent win worth reinforcing
    Achievement,
}

impl std::fmt::Display for ContextKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MemoryTrace => write!(f, "memory_trace"),
            Self::CalendarEvent => write!(f, "calendar_event"),
            Self::UserState => write!(f, "user_state"),
            Self::Environment => write!(f, "environment"),
            Self::Task => write!(f, "task"),
            Self::Achievement => write!(f, "achievement"),
        }
    }
}

/// A typed, timestamped piece of context.
///
/// Insertion order inside a frame is preserved for auditability; there is no
/// ordering guarantee between sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    /// What kind of context this is
    pub kind: ContextKind,
    /// When the item was captured
    pub timestamp: DateTime<Utc>,
    /// Free-form structured payload
    pub data: Value,
    /// Where the item came from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Confidence in [0, 1]
    pub confidence: f64,
}

impl ContextItem {
    /// Create a new context item with full confidence.
    pub fn new(kind: ContextKind, data: Value) -> Self {
        Self {
            kind,
            timestamp: clock::wall_now(),
            data,
            source: None,
            confidence: 1.0,
        }
    }

    /// Set the source tag.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Set the confidence, clamped to [0, 1].
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }
}

/// An action a frame proposes the runtime take after responding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedAction {
    /// Action kind (nudge, suggestion, environment_change, ...)
    pub kind: String,
    /// Delivery method hint (notification channel, device, ...)
    pub method: String,
    /// Action payload
    pub payload: Value,
    /// Optional delay before execution, in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_secs: Option<u64>,
}

/// The unit of context passed to a model invocation.
///
/// Built once by the frame builder, consumed by one loop invocation, never
/// mutated after first read. `add_context`/`add_action` exist for the
/// assembly phase only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Unique frame id
    pub id: String,
    /// User this frame was built for
    pub user_id: String,
    /// Agent that requested the frame
    pub agent_id: String,
    /// Optional task focus
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_focus: Option<String>,
    /// When the frame was assembled
    pub created_at: DateTime<Utc>,
    /// Ordered context items
    pub context: Vec<ContextItem>,
    /// Proposed follow-up actions
    pub actions: Vec<ProposedAction>,
}

impl Frame {
    /// Create an empty frame.
    pub fn new(user_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            id: format!("frame-{}", &Uuid::new_v4().simple().to_string()[..8]),
            user_id: user_id.into(),
            agent_id: agent_id.into(),
            task_focus: None,
            created_at: clock::wall_now(),
            context: Vec::new(),
            actions: Vec::new(),
        }
    }

    /// Set the task focus.
    pub fn with_task_focus(mut self, task_focus: impl Into<String>) -> Self {
        self.task_focus = Some(task_focus.into());
        self
    }

    /// Append a context item, preserving insertion order.
    pub fn add_context(&mut self, item: ContextItem) {
        self.context.push(item);
    }

    /// Append a proposed action.
    pub fn add_action(&mut self, action: ProposedAction) {
        self.actions.push(action);
    }

    /// The freshest user-state payload in the frame, if any.
    pub fn current_user_state(&self) -> Option<&Value> {
        self.context
            .iter()
            .rev()
            .find(|item| item.kind == ContextKind::UserState)
            .map(|item| &item.data)
    }
}

/// What the frame recommends the loop do about its own output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    None,
    SimplifyContext,
    ClarifyFocus,
}

/// A frame plus its derived scores.
///
/// The scores are pure functions of the context items at derivation time;
/// rebuilding from the same items yields identical values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextualFrame {
    /// The assembled frame
    pub frame: Frame,
    /// Cognitive load in [0, 1]
    pub cognitive_load: f64,
    /// Accessibility score in [0, 1]
    pub accessibility_score: f64,
    /// Classifier output over the two scores
    pub recommended_action: RecommendedAction,
    /// Overall confidence; lowered when optional sources were unavailable
    pub confidence: f64,
}

/// Nudge escalation tier. A tone hint, never a routing input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NudgeTier {
    /// "Let's get started?"
    Gentle,
    /// "Still ignoring that thing, huh?"
    Sarcastic,
    /// "Get. Up. And. Do. It."
    Sergeant,
}

impl Default for NudgeTier {
    fn default() -> Self {
        Self::Gentle
    }
}

impl std::fmt::Display for NudgeTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gentle => write!(f, "gentle"),
            Self::Sarcastic => write!(f, "sarcastic"),
            Self::Sergeant => write!(f, "sergeant"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_preserves_insertion_order() {
        let mut frame = Frame::new("u1", "main_loop");
        frame.add_context(ContextItem::new(ContextKind::Task, json!({"title": "report"})));
        frame.add_context(ContextItem::new(ContextKind::UserState, json!({"state": "low"})));
        frame.add_context(
            ContextItem::new(ContextKind::MemoryTrace, json!({"note": "a"})).with_source("traces"),
        );

        let kinds: Vec<ContextKind> = frame.context.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ContextKind::Task,
                ContextKind::UserState,
                ContextKind::MemoryTrace
            ]
        );
    }

    #[test]
    fn test_current_user_state_picks_freshest() {
        let mut frame = Frame::new("u1", "main_loop");
        frame.add_context(ContextItem::new(ContextKind::UserState, json!({"state": "low"})));
        frame.add_context(ContextItem::new(
            ContextKind::UserState,
            json!({"state": "energized"}),
        ));

        let state = frame.current_user_state().unwrap();
        assert_eq!(state["state"], "energized");
    }

    #[test]
    fn test_confidence_is_clamped() {
        let item = ContextItem::new(ContextKind::Environment, json!({})).with_confidence(1.7);
        assert_eq!(item.confidence, 1.0);
        let item = ContextItem::new(ContextKind::Environment, json!({})).with_confidence(-0.2);
        assert_eq!(item.confidence, 0.0);
    }
}
