//! Contextual frame assembly.
//!
//! The builder turns recent traces plus any registered context sources into
//! one immutable frame with derived scores. Given the same trace snapshot it
//! produces the same items in the same order, so the scores are reproducible
//! byte for byte.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::Deadline;
use crate::config::FrameConfig;
use crate::error::Result;
use crate::frame::store::{FrameKey, FrameStore};
use crate::frame::types::{
    ContextItem, ContextKind, ContextualFrame, Frame, RecommendedAction,
};
use crate::trace::TraceStore;

/// An optional provider of context items (calendar, environment, ...).
///
/// Failures and timeouts degrade the frame's confidence; they never fail the
/// build.
#[async_trait::async_trait]
pub trait ContextSource: Send + Sync {
    /// Source name, recorded on the items it produces.
    fn name(&self) -> &str;

    /// Collect context for a user.
    async fn collect(&self, user_id: &str, task_focus: Option<&str>) -> Result<Vec<ContextItem>>;
}

/// Cognitive load of a set of context items: a bounded weighted sum.
///
/// Adding an item never decreases the result; the sum clips at 1.0.
pub fn cognitive_load(items: &[ContextItem], config: &FrameConfig) -> f64 {
    let sum: f64 = items
        .iter()
        .map(|item| {
            config
                .load_weights
                .get(&item.kind)
                .copied()
                .unwrap_or(config.default_weight)
                .max(0.0)
        })
        .sum();
    sum.min(1.0)
}

/// Accessibility of a set of context items.
///
/// Strictly decreasing in cognitive load, 1.0 for an empty frame. Not the
/// complement of the load: low loads cost accessibility slower than high
/// loads do.
pub fn accessibility_score(load: f64) -> f64 {
    (1.0 - load.clamp(0.0, 1.0)).powf(0.7)
}

/// Classify the two scores into a recommended action.
pub fn recommend_action(load: f64, accessibility: f64, config: &FrameConfig) -> RecommendedAction {
    if load > config.load_high_water {
        RecommendedAction::SimplifyContext
    } else if accessibility < config.accessibility_low_water {
        RecommendedAction::ClarifyFocus
    } else {
        RecommendedAction::None
    }
}

/// Assembles contextual frames from the trace store and registered sources.
pub struct FrameBuilder {
    config: FrameConfig,
    traces: Arc<dyn TraceStore>,
    frames: Arc<dyn FrameStore>,
    sources: Vec<Arc<dyn ContextSource>>,
}

impl FrameBuilder {
    /// Create a builder over a trace store and frame cache.
    pub fn new(
        config: FrameConfig,
        traces: Arc<dyn TraceStore>,
        frames: Arc<dyn FrameStore>,
    ) -> Self {
        Self {
            config,
            traces,
            frames,
            sources: Vec::new(),
        }
    }

    /// Register an optional context source. Registration order is collection
    /// order, which keeps item order deterministic.
    pub fn with_source(mut self, source: Arc<dyn ContextSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Assemble a frame for one loop invocation.
    ///
    /// A cached frame for the same `(user, agent, task_focus)` within the
    /// cache TTL short-circuits the build. Trace store failure fails the
    /// build; optional-source failure lowers the frame confidence instead.
    pub async fn build(
        &self,
        user_id: &str,
        agent_id: &str,
        task_focus: Option<&str>,
        include_patterns: bool,
    ) -> Result<ContextualFrame> {
        let key = FrameKey::new(user_id, agent_id, task_focus.map(str::to_string));
        if let Some(cached) = self.frames.get(&key).await {
            debug!(user_id, agent_id, "frame cache hit");
            return Ok(cached);
        }

        let deadline = Deadline::after(Duration::from_secs(self.config.build_timeout_secs));

        let mut frame = Frame::new(user_id, agent_id);
        if let Some(focus) = task_focus {
            frame = frame.with_task_focus(focus);
            frame.add_context(
                ContextItem::new(ContextKind::Task, json!({ "title": focus }))
                    .with_source("task_focus"),
            );
        }

        if include_patterns {
            let records = self.traces.recent(user_id, self.config.trace_limit).await?;
            for record in &records {
                let mut item = ContextItem::new(
                    ContextKind::MemoryTrace,
                    json!({
                        "event_type": record.event_type,
                        "event_data": record.event_data,
                        "task_id": record.task_id,
                    }),
                )
                .with_source("trace_store")
                .with_confidence(record.confidence);
                item.timestamp = record.timestamp;
                frame.add_context(item);
            }
        }

        // Sources collect concurrently inside the per-source budget;
        // join_all returns them in registration order, which keeps item
        // order deterministic.
        let budget = Duration::from_secs(self.config.source_timeout_secs)
            .min(deadline.remaining());
        let collected = futures::future::join_all(self.sources.iter().map(|source| async move {
            match tokio::time::timeout(budget, source.collect(user_id, task_focus)).await {
                Ok(Ok(items)) => Some(items),
                Ok(Err(error)) => {
                    warn!(source = source.name(), %error, "context source failed");
                    None
                }
                Err(_) => {
                    warn!(source = source.name(), "context source timed out");
                    None
                }
            }
        }))
        .await;

        let mut unavailable_sources = 0u32;
        for items in collected {
            match items {
                Some(items) => {
                    for item in items {
                        frame.add_context(item);
                    }
                }
                None => unavailable_sources += 1,
            }
        }

        let load = cognitive_load(&frame.context, &self.config);
        let accessibility = accessibility_score(load);
        let contextual = ContextualFrame {
            recommended_action: recommend_action(load, accessibility, &self.config),
            cognitive_load: load,
            accessibility_score: accessibility,
            confidence: (1.0 - 0.15 * unavailable_sources as f64).max(0.4),
            frame,
        };

        self.frames
            .put(
                key,
                contextual.clone(),
                Duration::from_secs(self.config.cache_ttl_secs),
            )
            .await;

        Ok(contextual)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::frame::store::InMemoryFrameStore;
    use crate::trace::{InMemoryTraceStore, TraceId, TraceRecord};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn config() -> FrameConfig {
        FrameConfig::default()
    }

    struct FailingTraceStore;

    #[async_trait]
    impl TraceStore for FailingTraceStore {
        async fn append(&self, _record: TraceRecord) -> Result<()> {
            Err(Error::TraceStorage("down".to_string()))
        }
        async fn recent(&self, _user_id: &str, _limit: usize) -> Result<Vec<TraceRecord>> {
            Err(Error::TraceStorage("down".to_string()))
        }
        async fn get(&self, _id: &TraceId) -> Result<Option<TraceRecord>> {
            Err(Error::TraceStorage("down".to_string()))
        }
        async fn prune_older_than(&self, _cutoff: DateTime<Utc>) -> Result<u64> {
            Err(Error::TraceStorage("down".to_string()))
        }
    }

    struct FailingSource;

    #[async_trait]
    impl ContextSource for FailingSource {
        fn name(&self) -> &str {
            "calendar"
        }
        async fn collect(
            &self,
            _user_id: &str,
            _task_focus: Option<&str>,
        ) -> Result<Vec<ContextItem>> {
            Err(Error::service_unavailable("calendar"))
        }
    }

    struct StaticSource(Vec<ContextItem>);

    #[async_trait]
    impl ContextSource for StaticSource {
        fn name(&self) -> &str {
            "environment"
        }
        async fn collect(
            &self,
            _user_id: &str,
            _task_focus: Option<&str>,
        ) -> Result<Vec<ContextItem>> {
            Ok(self.0.clone())
        }
    }

    fn builder(traces: Arc<dyn TraceStore>) -> FrameBuilder {
        FrameBuilder::new(config(), traces, Arc::new(InMemoryFrameStore::new()))
    }

    #[test]
    fn test_empty_frame_scores() {
        let load = cognitive_load(&[], &config());
        assert_eq!(load, 0.0);
        assert_eq!(accessibility_score(load), 1.0);
        assert_eq!(
            recommend_action(load, accessibility_score(load), &config()),
            RecommendedAction::None
        );
    }

    #[test]
    fn test_high_load_recommends_simplification() {
        let config = config();
        assert_eq!(
            recommend_action(0.9, accessibility_score(0.9), &config),
            RecommendedAction::SimplifyContext
        );
    }

    #[tokio::test]
    async fn test_build_is_deterministic_over_a_trace_snapshot() {
        let traces = Arc::new(InMemoryTraceStore::new());
        for n in 0..4 {
            traces
                .append(TraceRecord::new("u1", "cognitive_interaction", json!({ "n": n })))
                .await
                .unwrap();
        }

        let first = builder(traces.clone())
            .build("u1", "main_loop", Some("report"), true)
            .await
            .unwrap();
        let second = builder(traces)
            .build("u1", "main_loop", Some("report"), true)
            .await
            .unwrap();

        assert_eq!(first.cognitive_load.to_bits(), second.cognitive_load.to_bits());
        assert_eq!(
            first.accessibility_score.to_bits(),
            second.accessibility_score.to_bits()
        );
        let kinds = |cf: &ContextualFrame| cf.frame.context.iter().map(|i| i.kind).collect::<Vec<_>>();
        assert_eq!(kinds(&first), kinds(&second));
    }

    #[tokio::test]
    async fn test_unavailable_source_degrades_confidence() {
        let traces = Arc::new(InMemoryTraceStore::new());
        let with_failure = FrameBuilder::new(
            config(),
            traces.clone(),
            Arc::new(InMemoryFrameStore::new()),
        )
        .with_source(Arc::new(FailingSource));

        let degraded = with_failure.build("u1", "main_loop", None, true).await.unwrap();
        let healthy = builder(traces).build("u1", "main_loop", None, true).await.unwrap();

        assert!(degraded.confidence < healthy.confidence);
    }

    #[tokio::test]
    async fn test_trace_store_failure_fails_the_build() {
        let result = builder(Arc::new(FailingTraceStore))
            .build("u1", "main_loop", None, true)
            .await;
        assert!(matches!(result, Err(Error::TraceStorage(_))));
    }

    #[tokio::test]
    async fn test_cache_short_circuits_second_build() {
        let traces = Arc::new(InMemoryTraceStore::new());
        let frames = Arc::new(InMemoryFrameStore::new());
        let builder = FrameBuilder::new(config(), traces.clone(), frames);

        let first = builder.build("u1", "main_loop", None, true).await.unwrap();

        // A new trace would change a fresh build, but the cache serves the
        // original frame within the TTL.
        traces
            .append(TraceRecord::new("u1", "cognitive_interaction", json!({})))
            .await
            .unwrap();
        let second = builder.build("u1", "main_loop", None, true).await.unwrap();

        assert_eq!(first.frame.id, second.frame.id);
        assert_eq!(first.frame.context.len(), second.frame.context.len());
    }

    #[tokio::test]
    async fn test_source_items_follow_trace_items() {
        let traces = Arc::new(InMemoryTraceStore::new());
        traces
            .append(TraceRecord::new("u1", "cognitive_interaction", json!({})))
            .await
            .unwrap();

        let env_item = ContextItem::new(ContextKind::Environment, json!({"device": "desk"}))
            .with_source("environment");
        let builder = FrameBuilder::new(
            config(),
            traces,
            Arc::new(InMemoryFrameStore::new()),
        )
        .with_source(Arc::new(StaticSource(vec![env_item])));

        let built = builder.build("u1", "main_loop", None, true).await.unwrap();
        let kinds: Vec<ContextKind> = built.frame.context.iter().map(|i| i.kind).collect();
        assert_eq!(kinds, vec![ContextKind::MemoryTrace, ContextKind::Environment]);
    }

    fn arb_kind() -> impl Strategy<Value = ContextKind> {
        prop_oneof![
            Just(ContextKind::MemoryTrace),
            Just(ContextKind::CalendarEvent),
            Just(ContextKind::UserState),
            Just(ContextKind::Environment),
            Just(ContextKind::Task),
            Just(ContextKind::Achievement),
        ]
    }

    proptest! {
        /// Load stays in [0, 1] for any item mix.
        #[test]
        fn load_is_bounded(kinds in proptest::collection::vec(arb_kind(), 0..100)) {
            let items: Vec<ContextItem> = kinds
                .into_iter()
                .map(|kind| ContextItem::new(kind, json!({})))
                .collect();
            let load = cognitive_load(&items, &config());
            prop_assert!((0.0..=1.0).contains(&load));
        }

        /// Adding an item never decreases the load.
        #[test]
        fn load_is_monotone(
            kinds in proptest::collection::vec(arb_kind(), 0..50),
            extra in arb_kind()
        ) {
            let mut items: Vec<ContextItem> = kinds
                .into_iter()
                .map(|kind| ContextItem::new(kind, json!({})))
                .collect();
            let before = cognitive_load(&items, &config());
            items.push(ContextItem::new(extra, json!({})));
            let after = cognitive_load(&items, &config());
            prop_assert!(after >= before);
        }

        /// Accessibility stays in [0, 1] and strictly decreases in load.
        #[test]
        fn accessibility_is_bounded_and_antitone(load_a in 0.0f64..1.0, load_b in 0.0f64..1.0) {
            let a = accessibility_score(load_a);
            let b = accessibility_score(load_b);
            prop_assert!((0.0..=1.0).contains(&a));
            if load_a < load_b {
                prop_assert!(a > b);
            }
        }
    }
}
