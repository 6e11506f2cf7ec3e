//! Local response cache for the middle routing tier.
//!
//! Keyed by a sha-256 of the full prompt, so identical prompts within the
//! TTL are answered without a model call.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::clock;

/// Cache key for a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(pub String);

impl CacheKey {
    /// Generate a key from raw prompt content.
    pub fn from_content(content: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        let hash = hasher.finalize();
        CacheKey(format!("{:x}", hash))
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0[..16]) // Short form for display
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    text: String,
    model: String,
    cached_at: Instant,
    hit_count: u64,
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Total cache hits
    pub hits: u64,
    /// Total cache misses
    pub misses: u64,
    /// Number of live entries
    pub entry_count: u64,
}

impl CacheStats {
    /// Calculate hit rate.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Recent-response cache.
pub struct ResponseCache {
    entries: Arc<RwLock<HashMap<CacheKey, CacheEntry>>>,
    stats: Arc<RwLock<CacheStats>>,
    ttl: Duration,
}

impl ResponseCache {
    /// Create a cache with the given entry TTL.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(CacheStats::default())),
            ttl,
        }
    }

    /// Look up a prompt; expired entries count as misses and are evicted.
    pub async fn get(&self, prompt: &str) -> Option<(String, String)> {
        let key = CacheKey::from_content(prompt);
        let mut entries = self.entries.write().await;

        let hit = match entries.get_mut(&key) {
            Some(entry) if clock::now().duration_since(entry.cached_at) < self.ttl => {
                entry.hit_count += 1;
                Some((entry.text.clone(), entry.model.clone()))
            }
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        };

        let mut stats = self.stats.write().await;
        if hit.is_some() {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }
        stats.entry_count = entries.len() as u64;

        hit
    }

    /// Store a completion for its prompt.
    pub async fn put(&self, prompt: &str, text: impl Into<String>, model: impl Into<String>) {
        let key = CacheKey::from_content(prompt);
        let mut entries = self.entries.write().await;
        entries.insert(
            key,
            CacheEntry {
                text: text.into(),
                model: model.into(),
                cached_at: clock::now(),
                hit_count: 0,
            },
        );
        self.stats.write().await.entry_count = entries.len() as u64;
    }

    /// Current statistics.
    pub async fn stats(&self) -> CacheStats {
        *self.stats.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_keys_are_stable_and_distinct() {
        assert_eq!(CacheKey::from_content("a"), CacheKey::from_content("a"));
        assert_ne!(CacheKey::from_content("a"), CacheKey::from_content("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_within_ttl_miss_after() {
        let cache = ResponseCache::new(Duration::from_secs(300));
        cache.put("prompt", "answer", "model-x").await;

        let (text, model) = cache.get("prompt").await.unwrap();
        assert_eq!(text, "answer");
        assert_eq!(model, "model-x");

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(cache.get("prompt").await.is_none());

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate(), 0.5);
    }
}
