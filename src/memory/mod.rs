// Memory / knowledge client
//
// The pipeline only sees `KnowledgeStore::{store, search}` and their two
// failure kinds. Indexing, distance metric and persistence stay inside the
// backend (Qdrant in production).

mod embeddings;
mod local;
mod qdrant;

pub use embeddings::{cosine_similarity, EmbeddingEngine, HashingEmbedding};
pub use local::{DisabledStore, InMemoryStore};
pub use qdrant::QdrantStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::config::MemoryConfig;
use crate::errors::MemoryError;

/// What a stored record is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    /// Facts committed with commitkb
    Knowledge,
    /// Persona and preference memories that shape every prompt
    Personality,
    /// Past question/answer pairs
    Interaction,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Knowledge => "knowledge",
            MemoryKind::Personality => "personality",
            MemoryKind::Interaction => "interaction",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "knowledge" => Some(MemoryKind::Knowledge),
            "personality" => Some(MemoryKind::Personality),
            "interaction" => Some(MemoryKind::Interaction),
            _ => None,
        }
    }
}

/// One search result, best first
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryHit {
    pub content: String,
    pub kind: MemoryKind,
    pub score: f32,
}

#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Persist one record and return its new id. No deduplication.
    async fn store(
        &self,
        content: &str,
        kind: MemoryKind,
        metadata: Map<String, Value>,
    ) -> Result<String, MemoryError>;

    /// Records most similar to `query`, highest score first.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<MemoryHit>, MemoryError>;

    fn name(&self) -> &str;
}

/// Build the store selected by the config.
///
/// An enabled Qdrant store gets its collections created in the background,
/// so this must run inside a tokio runtime.
pub fn build_store(config: &MemoryConfig) -> anyhow::Result<Arc<dyn KnowledgeStore>> {
    if !config.enabled {
        return Ok(Arc::new(DisabledStore));
    }
    let store = Arc::new(QdrantStore::new(config)?);
    let init = store.clone();
    tokio::spawn(async move { init.ensure_collections().await });
    Ok(store)
}

/// Sort hits best-first and keep `limit` of them.
pub(crate) fn rank(mut hits: Vec<MemoryHit>, limit: usize) -> Vec<MemoryHit> {
    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    hits.truncate(limit);
    hits
}
