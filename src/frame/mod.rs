//! Contextual frames: types, assembly, and the short-TTL cache.

mod builder;
mod store;
mod types;

pub use builder::{
    accessibility_score, cognitive_load, recommend_action, ContextSource, FrameBuilder,
};
pub use store::{FrameKey, FrameStore, InMemoryFrameStore};
pub use types::{
    ContextItem, ContextKind, ContextualFrame, Frame, NudgeTier, ProposedAction,
    RecommendedAction,
};
