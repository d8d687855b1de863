// Qdrant REST adapter
//
// Two collections: personality memories and committed knowledge. Knowledge
// hits below the configured score threshold are dropped; personality hits are
// always returned so the persona is applied even to unrelated questions.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::embeddings::{EmbeddingEngine, HashingEmbedding};
use super::{rank, KnowledgeStore, MemoryHit, MemoryKind};
use crate::config::MemoryConfig;
use crate::errors::MemoryError;

pub struct QdrantStore {
    client: Client,
    base_url: String,
    personality_collection: String,
    knowledge_collection: String,
    score_threshold: f32,
    embedder: HashingEmbedding,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    result: Vec<ScoredPoint>,
}

#[derive(Debug, Deserialize)]
struct ScoredPoint {
    score: f32,
    #[serde(default)]
    payload: Option<Map<String, Value>>,
}

impl QdrantStore {
    pub fn new(config: &MemoryConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: config.qdrant_url.trim_end_matches('/').to_string(),
            personality_collection: config.personality_collection.clone(),
            knowledge_collection: config.knowledge_collection.clone(),
            score_threshold: config.knowledge_score_threshold,
            embedder: HashingEmbedding::new(config.vector_dim),
        })
    }

    fn collection_for(&self, kind: MemoryKind) -> &str {
        match kind {
            MemoryKind::Personality => &self.personality_collection,
            MemoryKind::Knowledge | MemoryKind::Interaction => &self.knowledge_collection,
        }
    }

    /// Create both collections if they do not exist yet. Failures are logged,
    /// not fatal: the daemon runs without memory until Qdrant comes back.
    pub async fn ensure_collections(&self) {
        for collection in [&self.personality_collection, &self.knowledge_collection] {
            let url = format!("{}/collections/{}", self.base_url, collection);
            let body = json!({
                "vectors": { "size": self.embedder.dimension(), "distance": "Cosine" }
            });
            match self.client.put(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() || resp.status() == StatusCode::CONFLICT => {
                    debug!(collection = %collection, "qdrant collection ready");
                }
                Ok(resp) => {
                    // Qdrant answers 400 "already exists" on some versions
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    if !text.contains("already exists") {
                        warn!(collection = %collection, %status, "cannot create qdrant collection");
                    }
                }
                Err(e) => warn!(collection = %collection, error = %e, "qdrant unreachable"),
            }
        }
    }

    async fn search_collection(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        threshold: Option<f32>,
        default_kind: MemoryKind,
    ) -> Result<Vec<MemoryHit>, MemoryError> {
        let url = format!("{}/collections/{}/points/search", self.base_url, collection);
        let mut body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
        });
        if let Some(t) = threshold {
            // f32 -> f64 without the binary noise (0.6 stays 0.6 on the wire)
            body["score_threshold"] = json!((f64::from(t) * 1e6).round() / 1e6);
        }

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| MemoryError::SearchUnavailable(e.to_string()))?;

        // Missing collection: nothing stored yet
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !resp.status().is_success() {
            return Err(MemoryError::SearchUnavailable(format!(
                "qdrant search on {} returned {}",
                collection,
                resp.status()
            )));
        }

        let parsed: SearchResponse = resp
            .json()
            .await
            .map_err(|e| MemoryError::SearchUnavailable(format!("bad search response: {}", e)))?;

        Ok(parsed
            .result
            .into_iter()
            .filter_map(|point| {
                let payload = point.payload?;
                let content = payload
                    .get("content")
                    .or_else(|| payload.get("text"))
                    .and_then(Value::as_str)?
                    .to_string();
                let kind = payload
                    .get("kind")
                    .and_then(Value::as_str)
                    .and_then(MemoryKind::parse)
                    .unwrap_or(default_kind);
                Some(MemoryHit {
                    content,
                    kind,
                    score: point.score,
                })
            })
            .collect())
    }
}

#[async_trait]
impl KnowledgeStore for QdrantStore {
    async fn store(
        &self,
        content: &str,
        kind: MemoryKind,
        metadata: Map<String, Value>,
    ) -> Result<String, MemoryError> {
        let id = Uuid::new_v4().to_string();
        let collection = self.collection_for(kind);

        let mut payload = metadata;
        payload.insert("content".into(), Value::String(content.to_string()));
        payload.insert("kind".into(), Value::String(kind.as_str().to_string()));
        payload.insert("created_at".into(), Value::String(Utc::now().to_rfc3339()));

        let url = format!("{}/collections/{}/points?wait=true", self.base_url, collection);
        let body = json!({
            "points": [{
                "id": id,
                "vector": self.embedder.embed(content),
                "payload": payload,
            }]
        });

        let resp = self
            .client
            .put(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| MemoryError::StoreUnavailable(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(MemoryError::StoreUnavailable(format!(
                "qdrant upsert into {} returned {}: {}",
                collection, status, text
            )));
        }

        debug!(collection = %collection, id = %id, "stored memory");
        Ok(id)
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<MemoryHit>, MemoryError> {
        let vector = self.embedder.embed(query);

        let (personality, knowledge) = tokio::join!(
            self.search_collection(
                &self.personality_collection,
                &vector,
                limit,
                None,
                MemoryKind::Personality
            ),
            self.search_collection(
                &self.knowledge_collection,
                &vector,
                limit,
                Some(self.score_threshold),
                MemoryKind::Knowledge
            ),
        );

        // One collection down is tolerated; both down is an outage
        let mut hits = Vec::new();
        let mut last_err = None;
        for result in [personality, knowledge] {
            match result {
                Ok(mut found) => hits.append(&mut found),
                Err(e) => {
                    warn!(error = %e, "qdrant search failed");
                    last_err = Some(e);
                }
            }
        }
        if hits.is_empty() {
            if let Some(e) = last_err {
                return Err(e);
            }
        }
        Ok(rank(hits, limit))
    }

    fn name(&self) -> &str {
        "qdrant"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn config(url: String) -> MemoryConfig {
        MemoryConfig {
            qdrant_url: url,
            vector_dim: 8,
            ..MemoryConfig::default()
        }
    }

    #[tokio::test]
    async fn test_store_upserts_into_knowledge_collection() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/collections/fazai_kb/points")
            .match_query(Matcher::UrlEncoded("wait".into(), "true".into()))
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex(r#""content":"disk is /dev/sda""#.into()),
                Matcher::Regex(r#""kind":"knowledge""#.into()),
            ]))
            .with_status(200)
            .with_body(r#"{"result":{"status":"completed"},"status":"ok"}"#)
            .expect(2)
            .create_async()
            .await;

        let store = QdrantStore::new(&config(server.url())).unwrap();
        let a = store.store("disk is /dev/sda", MemoryKind::Knowledge, Map::new()).await.unwrap();
        let b = store.store("disk is /dev/sda", MemoryKind::Knowledge, Map::new()).await.unwrap();
        assert_ne!(a, b);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_store_failure_is_store_unavailable() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("PUT", "/collections/fazai_memory/points")
            .match_query(Matcher::Any)
            .with_status(500)
            .create_async()
            .await;

        let store = QdrantStore::new(&config(server.url())).unwrap();
        let err = store.store("be terse", MemoryKind::Personality, Map::new()).await.unwrap_err();
        assert_eq!(err.kind(), "StoreUnavailable");
    }

    #[tokio::test]
    async fn test_search_merges_collections() {
        let mut server = mockito::Server::new_async().await;
        let _personality = server
            .mock("POST", "/collections/fazai_memory/points/search")
            .with_status(200)
            .with_body(r#"{"result":[{"id":"p1","score":0.3,"payload":{"content":"be terse"}}]}"#)
            .create_async()
            .await;
        let _knowledge = server
            .mock("POST", "/collections/fazai_kb/points/search")
            .match_body(Matcher::PartialJson(json!({ "score_threshold": 0.6 })))
            .with_status(200)
            .with_body(r#"{"result":[{"id":"k1","score":0.8,"payload":{"content":"nginx in /etc/nginx","kind":"knowledge"}}]}"#)
            .create_async()
            .await;

        let store = QdrantStore::new(&config(server.url())).unwrap();
        let hits = store.search("nginx", 5).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].kind, MemoryKind::Knowledge);
        assert_eq!(hits[1].kind, MemoryKind::Personality);
        assert_eq!(hits[1].content, "be terse");
    }

    #[tokio::test]
    async fn test_missing_collections_are_empty() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", Matcher::Regex(r"^/collections/.*/points/search$".into()))
            .with_status(404)
            .create_async()
            .await;

        let store = QdrantStore::new(&config(server.url())).unwrap();
        assert!(store.search("anything", 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_qdrant_is_search_unavailable() {
        let store = QdrantStore::new(&config("http://127.0.0.1:1".into())).unwrap();
        let err = store.search("anything", 3).await.unwrap_err();
        assert_eq!(err.kind(), "SearchUnavailable");
    }
}
