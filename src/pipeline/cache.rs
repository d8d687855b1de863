// N1 response cache
//
// Keyed by SHA-256 of (action, normalized prompt). Entries expire after the
// configured TTL; when full, expired entries go first, then the oldest one.

use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::tier::{Answer, EscalationTier, TierContext, TierHandler, TierOutcome};
use crate::config::CacheConfig;
use crate::protocol::Action;

#[derive(Debug, Clone)]
struct CacheEntry {
    text: String,
    steps: Option<Vec<String>>,
    inserted: Instant,
}

/// A cached answer
#[derive(Debug, Clone, PartialEq)]
pub struct CachedAnswer {
    pub text: String,
    pub steps: Option<Vec<String>>,
}

pub struct ResponseCache {
    entries: DashMap<String, CacheEntry>,
    capacity: usize,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            ttl,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.capacity, Duration::from_secs(config.ttl_secs))
    }

    pub fn get(&self, action: Action, prompt: &str) -> Option<CachedAnswer> {
        let key = cache_key(action, prompt);
        let ttl = self.ttl;
        // Drop the entry on the way out if it has expired
        if self
            .entries
            .remove_if(&key, |_, e| e.inserted.elapsed() >= ttl)
            .is_some()
        {
            return None;
        }
        self.entries.get(&key).map(|e| CachedAnswer {
            text: e.text.clone(),
            steps: e.steps.clone(),
        })
    }

    pub fn insert(&self, action: Action, prompt: &str, text: &str, steps: Option<Vec<String>>) {
        let key = cache_key(action, prompt);
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.evict();
        }
        self.entries.insert(
            key,
            CacheEntry {
                text: text.to_string(),
                steps,
                inserted: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget everything (new knowledge may change answers)
    pub fn clear(&self) {
        self.entries.clear();
    }

    fn evict(&self) {
        let ttl = self.ttl;
        self.entries.retain(|_, e| e.inserted.elapsed() < ttl);
        if self.entries.len() < self.capacity {
            return;
        }
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.value().inserted)
            .map(|e| e.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}

fn cache_key(action: Action, prompt: &str) -> String {
    let normalized = prompt
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(action.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// N1 handler: serve a previous usable answer for the same request
pub struct CacheTier {
    cache: Arc<ResponseCache>,
    timeout: Duration,
}

impl CacheTier {
    pub fn new(cache: Arc<ResponseCache>, timeout: Duration) -> Self {
        Self { cache, timeout }
    }
}

#[async_trait]
impl TierHandler for CacheTier {
    fn tier(&self) -> EscalationTier {
        EscalationTier::Cache
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn attempt(&self, ctx: &TierContext<'_>) -> TierOutcome {
        if !ctx.cacheable() {
            return TierOutcome::LowConfidence("not cacheable".to_string());
        }
        match self.cache.get(ctx.action, ctx.prompt) {
            Some(hit) => TierOutcome::Usable(Answer {
                text: hit.text,
                steps: hit.steps,
                score: 1.0,
                inference_time: Duration::ZERO,
                backend: "cache".to_string(),
            }),
            None => TierOutcome::LowConfidence("cache miss".to_string()),
        }
    }
}
