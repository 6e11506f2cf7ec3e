//! Short-TTL frame cache.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::clock;
use crate::frame::types::ContextualFrame;

/// Cache key for an assembled frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FrameKey {
    pub user_id: String,
    pub agent_id: String,
    pub task_focus: Option<String>,
}

impl FrameKey {
    pub fn new(
        user_id: impl Into<String>,
        agent_id: impl Into<String>,
        task_focus: Option<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            agent_id: agent_id.into(),
            task_focus,
        }
    }
}

/// Short-TTL cache of assembled frames. Returning `None` is always legal.
#[async_trait]
pub trait FrameStore: Send + Sync {
    /// Cache a frame under a key for `ttl`.
    async fn put(&self, key: FrameKey, frame: ContextualFrame, ttl: Duration);

    /// Fetch a cached frame if present and unexpired.
    async fn get(&self, key: &FrameKey) -> Option<ContextualFrame>;

    /// Drop every cached frame.
    async fn clear(&self);
}

struct CachedFrame {
    frame: ContextualFrame,
    expires_at: Instant,
}

/// In-memory frame cache.
#[derive(Default)]
pub struct InMemoryFrameStore {
    entries: Arc<RwLock<HashMap<FrameKey, CachedFrame>>>,
}

impl InMemoryFrameStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FrameStore for InMemoryFrameStore {
    async fn put(&self, key: FrameKey, frame: ContextualFrame, ttl: Duration) {
        let mut entries = self.entries.write().await;
        entries.insert(
            key,
            CachedFrame {
                frame,
                expires_at: clock::now() + ttl,
            },
        );
    }

    async fn get(&self, key: &FrameKey) -> Option<ContextualFrame> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(cached) if cached.expires_at > clock::now() => {
                    return Some(cached.frame.clone())
                }
                Some(_) => {}
                None => return None,
            }
        }

        // Expired entry: evict under the write lock
        let mut entries = self.entries.write().await;
        if entries
            .get(key)
            .is_some_and(|cached| cached.expires_at <= clock::now())
        {
            entries.remove(key);
        }
        None
    }

    async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::types::{Frame, RecommendedAction};

    fn sample_frame() -> ContextualFrame {
        ContextualFrame {
            frame: Frame::new("u1", "main_loop"),
            cognitive_load: 0.2,
            accessibility_score: 0.9,
            recommended_action: RecommendedAction::None,
            confidence: 1.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let store = InMemoryFrameStore::new();
        let key = FrameKey::new("u1", "main_loop", None);

        store
            .put(key.clone(), sample_frame(), Duration::from_secs(60))
            .await;
        assert!(store.get(&key).await.is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(store.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_task_focus_is_part_of_the_key() {
        let store = InMemoryFrameStore::new();
        let keyed = FrameKey::new("u1", "main_loop", Some("report".to_string()));
        store
            .put(keyed.clone(), sample_frame(), Duration::from_secs(60))
            .await;

        assert!(store.get(&keyed).await.is_some());
        assert!(store
            .get(&FrameKey::new("u1", "main_loop", None))
            .await
            .is_none());
    }
}
