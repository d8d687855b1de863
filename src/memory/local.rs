// In-process stores: a vector store for tests and single-host setups without
// Qdrant, and the store used when memory is switched off.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::embeddings::{cosine_similarity, EmbeddingEngine, HashingEmbedding};
use super::{rank, KnowledgeStore, MemoryHit, MemoryKind};
use crate::errors::MemoryError;

struct Record {
    id: String,
    content: String,
    kind: MemoryKind,
    vector: Vec<f32>,
    metadata: Map<String, Value>,
}

/// Vector store held in memory, lost on restart
pub struct InMemoryStore {
    records: RwLock<Vec<Record>>,
    embedder: HashingEmbedding,
}

impl InMemoryStore {
    pub fn new(dimension: usize) -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            embedder: HashingEmbedding::new(dimension),
        }
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.records.read().await.iter().any(|r| r.id == id)
    }

    /// Metadata stored with a record, including its `created_at` stamp
    pub async fn metadata(&self, id: &str) -> Option<Map<String, Value>> {
        self.records
            .read()
            .await
            .iter()
            .find(|r| r.id == id)
            .map(|r| r.metadata.clone())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(crate::config::constants::DEFAULT_VECTOR_DIM)
    }
}

#[async_trait]
impl KnowledgeStore for InMemoryStore {
    async fn store(
        &self,
        content: &str,
        kind: MemoryKind,
        mut metadata: Map<String, Value>,
    ) -> Result<String, MemoryError> {
        let id = Uuid::new_v4().to_string();
        metadata.insert("created_at".into(), Value::String(Utc::now().to_rfc3339()));
        self.records.write().await.push(Record {
            id: id.clone(),
            content: content.to_string(),
            kind,
            vector: self.embedder.embed(content),
            metadata,
        });
        Ok(id)
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<MemoryHit>, MemoryError> {
        let query_vec = self.embedder.embed(query);
        let records = self.records.read().await;
        let hits = records
            .iter()
            .map(|r| MemoryHit {
                content: r.content.clone(),
                kind: r.kind,
                score: cosine_similarity(&query_vec, &r.vector),
            })
            .filter(|h| h.score > 0.0)
            .collect();
        Ok(rank(hits, limit))
    }

    fn name(&self) -> &str {
        "in-memory"
    }
}

/// Store used when `memory.enabled = false`; every call fails
pub struct DisabledStore;

#[async_trait]
impl KnowledgeStore for DisabledStore {
    async fn store(
        &self,
        _content: &str,
        _kind: MemoryKind,
        _metadata: Map<String, Value>,
    ) -> Result<String, MemoryError> {
        Err(MemoryError::StoreUnavailable("memory is disabled".into()))
    }

    async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<MemoryHit>, MemoryError> {
        Err(MemoryError::SearchUnavailable("memory is disabled".into()))
    }

    fn name(&self) -> &str {
        "disabled"
    }
}
