//! Tiered response routing.
//!
//! Tier order: safety override, canned intent table, local response cache,
//! cloud model. Lowest tier wins; within the intent table the first
//! configured match wins. A cloud failure degrades to the canned fallback
//! instead of surfacing an error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock;
use crate::config::LlmConfig;
use crate::error::Result;
use crate::frame::{ContextualFrame, NudgeTier};
use crate::llm::cache::ResponseCache;
use crate::llm::client::CloudModel;
use crate::llm::types::{LlmResponse, ResponseSource};
use crate::safety::{SafetyMonitor, SafetyVerdict};

/// Routes a request down the tier ladder.
pub struct ModelRouter {
    config: LlmConfig,
    safety: Arc<SafetyMonitor>,
    intents: HashMap<String, String>,
    cache: ResponseCache,
    cloud: Option<Arc<dyn CloudModel>>,
}

impl ModelRouter {
    /// Create a router. `cloud` may be absent; the fallback tier then
    /// answers whatever the cheaper tiers miss.
    pub fn new(
        config: LlmConfig,
        safety: Arc<SafetyMonitor>,
        cloud: Option<Arc<dyn CloudModel>>,
    ) -> Self {
        let mut intents = HashMap::new();
        // First configured entry wins on duplicate keys
        for (intent, response) in &config.intents {
            intents
                .entry(Self::normalize(intent))
                .or_insert_with(|| response.clone());
        }

        let cache = ResponseCache::new(Duration::from_secs(config.cache_ttl_secs));

        Self {
            config,
            safety,
            intents,
            cache,
            cloud,
        }
    }

    fn normalize(input: &str) -> String {
        input.trim().to_lowercase()
    }

    /// The safety monitor this router consults.
    pub fn safety(&self) -> &SafetyMonitor {
        &self.safety
    }

    fn compose_prompt(
        &self,
        user_input: &str,
        frame: &ContextualFrame,
        nudge_tier: NudgeTier,
    ) -> String {
        let tone = match nudge_tier {
            NudgeTier::Gentle => "Keep the tone gentle and low-pressure.",
            NudgeTier::Sarcastic => "A little dry wit is welcome; stay kind.",
            NudgeTier::Sergeant => "Be direct and energizing; short sentences.",
        };

        let mut prompt = String::new();
        if let Some(focus) = &frame.frame.task_focus {
            prompt.push_str(&format!("Current focus: {}\n", focus));
        }
        prompt.push_str(&format!(
            "Cognitive load: {:.2}. Keep the reply short and actionable. {}\n\n",
            frame.cognitive_load, tone
        ));
        prompt.push_str(user_input);
        prompt
    }

    fn fallback(&self, latency_ms: u64) -> LlmResponse {
        LlmResponse {
            text: self.config.fallback_text.clone(),
            source: ResponseSource::LocalCached,
            confidence: self.config.fallback_confidence,
            model: "fallback".to_string(),
            latency_ms,
        }
    }

    /// Process one request through the tier ladder.
    ///
    /// The safety monitor is consulted before any tier; its verdict skips
    /// everything else. This method never fails on cloud trouble; it
    /// degrades.
    pub async fn process(
        &self,
        user_input: &str,
        frame: &ContextualFrame,
        nudge_tier: NudgeTier,
    ) -> Result<LlmResponse> {
        let started = clock::now();

        if let SafetyVerdict::Override { response, .. } =
            self.safety.evaluate(user_input, Some(frame))
        {
            return Ok(response);
        }

        // Tier 1: canned intent table
        if let Some(text) = self.intents.get(&Self::normalize(user_input)) {
            debug!("intent table hit");
            return Ok(LlmResponse {
                text: text.clone(),
                source: ResponseSource::PatternMatch,
                confidence: 0.9,
                model: "intent_table".to_string(),
                latency_ms: started.elapsed().as_millis() as u64,
            });
        }

        // Tier 2: local response cache
        let prompt = self.compose_prompt(user_input, frame, nudge_tier);
        if let Some((text, model)) = self.cache.get(&prompt).await {
            debug!("response cache hit");
            return Ok(LlmResponse {
                text,
                source: ResponseSource::LocalCached,
                confidence: 0.8,
                model,
                latency_ms: started.elapsed().as_millis() as u64,
            });
        }

        // Tier 3: cloud model with bounded retries
        let Some(cloud) = &self.cloud else {
            return Ok(self.fallback(started.elapsed().as_millis() as u64));
        };

        let timeout = Duration::from_secs(self.config.cloud_timeout_secs);
        let mut attempt = 0u32;
        loop {
            let call = cloud.complete(
                &prompt,
                self.config.max_tokens,
                self.config.temperature,
                timeout,
            );
            match tokio::time::timeout(timeout, call).await {
                Ok(Ok(completion)) => {
                    self.cache
                        .put(&prompt, completion.text.clone(), completion.model.clone())
                        .await;
                    return Ok(LlmResponse {
                        text: completion.text,
                        source: ResponseSource::Cloud,
                        confidence: 0.85,
                        model: completion.model,
                        latency_ms: started.elapsed().as_millis() as u64,
                    });
                }
                Ok(Err(error)) => {
                    warn!(attempt, %error, "cloud completion failed");
                }
                Err(_) => {
                    warn!(attempt, timeout_secs = timeout.as_secs(), "cloud completion timed out");
                }
            }

            attempt += 1;
            if attempt > self.config.cloud_max_retries {
                return Ok(self.fallback(started.elapsed().as_millis() as u64));
            }
            tokio::time::sleep(Duration::from_millis(200 * u64::from(attempt))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SafetyConfig;
    use crate::error::Error;
    use crate::frame::{Frame, RecommendedAction};
    use crate::llm::types::CloudCompletion;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn frame() -> ContextualFrame {
        ContextualFrame {
            frame: Frame::new("u1", "main_loop"),
            cognitive_load: 0.2,
            accessibility_score: 0.9,
            recommended_action: RecommendedAction::None,
            confidence: 1.0,
        }
    }

    fn safety() -> Arc<SafetyMonitor> {
        Arc::new(SafetyMonitor::new(SafetyConfig::default()).unwrap())
    }

    struct ScriptedModel {
        calls: AtomicU32,
        fail_first: u32,
    }

    impl ScriptedModel {
        fn new(fail_first: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first,
            }
        }
    }

    #[async_trait]
    impl CloudModel for ScriptedModel {
        async fn complete(
            &self,
            _prompt: &str,
            _max_tokens: u32,
            _temperature: f32,
            _timeout: Duration,
        ) -> Result<CloudCompletion> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(Error::Model("upstream 500".to_string()));
            }
            Ok(CloudCompletion {
                text: "cloud says hi".to_string(),
                model: "test-model".to_string(),
            })
        }

        fn model_id(&self) -> &str {
            "test-model"
        }
    }

    struct HangingModel;

    #[async_trait]
    impl CloudModel for HangingModel {
        async fn complete(
            &self,
            _prompt: &str,
            _max_tokens: u32,
            _temperature: f32,
            _timeout: Duration,
        ) -> Result<CloudCompletion> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!("the router must time this call out")
        }

        fn model_id(&self) -> &str {
            "hanging-model"
        }
    }

    fn router(cloud: Option<Arc<dyn CloudModel>>) -> ModelRouter {
        ModelRouter::new(LlmConfig::default(), safety(), cloud)
    }

    #[tokio::test]
    async fn test_safety_override_skips_every_tier() {
        let router = router(Some(Arc::new(ScriptedModel::new(0))));
        let response = router
            .process("I keep thinking about self-harm", &frame(), NudgeTier::Gentle)
            .await
            .unwrap();
        assert_eq!(response.source, ResponseSource::HardCoded);
        assert_eq!(response.confidence, 1.0);
    }

    #[tokio::test]
    async fn test_intent_table_beats_cloud() {
        let cloud = Arc::new(ScriptedModel::new(0));
        let router = router(Some(cloud.clone()));

        let response = router
            .process("  HELLO ", &frame(), NudgeTier::Gentle)
            .await
            .unwrap();
        assert_eq!(response.source, ResponseSource::PatternMatch);
        assert_eq!(cloud.calls.load(Ordering::SeqCst), 0);
        assert!(response.latency_ms < 10);
    }

    #[tokio::test]
    async fn test_first_configured_intent_wins() {
        let config = LlmConfig {
            intents: vec![
                ("ping".to_string(), "first".to_string()),
                ("ping".to_string(), "second".to_string()),
            ],
            ..LlmConfig::default()
        };
        let router = ModelRouter::new(config, safety(), None);
        let response = router.process("ping", &frame(), NudgeTier::Gentle).await.unwrap();
        assert_eq!(response.text, "first");
    }

    #[tokio::test]
    async fn test_identical_prompt_is_served_from_cache() {
        let cloud = Arc::new(ScriptedModel::new(0));
        let router = router(Some(cloud.clone()));

        let first = router
            .process("long unusual question", &frame(), NudgeTier::Gentle)
            .await
            .unwrap();
        assert_eq!(first.source, ResponseSource::Cloud);

        let second = router
            .process("long unusual question", &frame(), NudgeTier::Gentle)
            .await
            .unwrap();
        assert_eq!(second.source, ResponseSource::LocalCached);
        assert_eq!(second.text, first.text);
        assert_eq!(cloud.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cloud_retry_then_success() {
        let cloud = Arc::new(ScriptedModel::new(1));
        let router = router(Some(cloud.clone()));

        let response = router
            .process("something novel", &frame(), NudgeTier::Gentle)
            .await
            .unwrap();
        assert_eq!(response.source, ResponseSource::Cloud);
        assert_eq!(cloud.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cloud_exhaustion_degrades_to_fallback() {
        let cloud = Arc::new(ScriptedModel::new(u32::MAX));
        let router = router(Some(cloud.clone()));

        let response = router
            .process("something novel", &frame(), NudgeTier::Gentle)
            .await
            .unwrap();
        assert_eq!(response.source, ResponseSource::LocalCached);
        assert_eq!(response.confidence, LlmConfig::default().fallback_confidence);
        // initial call plus the configured retries
        assert_eq!(
            cloud.calls.load(Ordering::SeqCst),
            1 + LlmConfig::default().cloud_max_retries
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_cloud_call_times_out_into_fallback() {
        let router = router(Some(Arc::new(HangingModel)));
        let response = router
            .process("something novel", &frame(), NudgeTier::Gentle)
            .await
            .unwrap();
        assert_eq!(response.source, ResponseSource::LocalCached);
        assert_eq!(response.model, "fallback");
    }

    #[tokio::test]
    async fn test_no_cloud_configured_goes_straight_to_fallback() {
        let router = router(None);
        let response = router
            .process("something novel", &frame(), NudgeTier::Gentle)
            .await
            .unwrap();
        assert_eq!(response.source, ResponseSource::LocalCached);
        assert_eq!(response.model, "fallback");
    }

    #[tokio::test]
    async fn test_nudge_tier_changes_tone_not_routing() {
        let router = router(None);
        for tier in [NudgeTier::Gentle, NudgeTier::Sarcastic, NudgeTier::Sergeant] {
            let response = router.process("hello", &frame(), tier).await.unwrap();
            assert_eq!(response.source, ResponseSource::PatternMatch);
        }
    }
}
