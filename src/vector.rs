//! Vector index client.
//!
//! The [`VectorIndex`] trait abstracts chunk storage and k-nearest
//! retrieval, keyed by conversation id. Indexing is isolated per
//! conversation: a query never returns chunks from another conversation,
//! and upserts are idempotent with respect to `chunk_id`.
//!
//! Retrieval accepts either query text or a pre-computed embedding
//! ([`QueryKey`]); the orchestrator sends an embedding whenever the
//! embedding provider is enabled and falls back to text otherwise.
//!
//! Two backends:
//! - **[`MemoryVectorIndex`]** — in-process store behind `RwLock`; scores
//!   embedding queries by cosine similarity over stored vectors and text
//!   queries by term overlap. Used by tests and offline runs.
//! - **[`HttpVectorIndex`]** — an OpenSearch-style HTTP backend:
//!   documents are written under their `chunk_id` (vectors included when
//!   present), text retrieval is a bool query of a `conversation_id` term
//!   filter plus a `multi_match`, embedding retrieval is a `knn` query
//!   under the same filter.
//!
//! Retrieval scores are normalized to `[0, 1]`; ties are broken by lower
//! first line of the chunk span.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::VectorConfig;
use crate::embedding::cosine_similarity;
use crate::error::{EngineError, EngineResult};
use crate::models::{Chunk, ScoredChunk};

/// What a retrieval ranks against: query text or its embedding.
#[derive(Debug, Clone, Copy)]
pub enum QueryKey<'a> {
    Text(&'a str),
    Embedding(&'a [f32]),
}

/// Capability interface over the chunk store.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or update chunks for a conversation. Idempotent per
    /// `chunk_id`.
    async fn upsert(&self, conversation_id: &str, chunks: &[Chunk]) -> EngineResult<()>;

    /// Return up to `k` chunks of the conversation ranked by relevance to
    /// the query key. Scores are in `[0, 1]`.
    async fn query(
        &self,
        conversation_id: &str,
        key: QueryKey<'_>,
        k: usize,
    ) -> EngineResult<Vec<ScoredChunk>>;

    /// Remove all chunks of a conversation.
    async fn drop_conversation(&self, conversation_id: &str) -> EngineResult<()>;

    /// Cheap liveness probe used by the health endpoint.
    async fn probe(&self) -> EngineResult<()>;
}

// ============ In-memory backend ============

/// In-process vector index for tests and offline runs.
pub struct MemoryVectorIndex {
    // conversation_id → chunk_id → chunk
    store: RwLock<HashMap<String, HashMap<String, Chunk>>>,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self {
            store: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryVectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn upsert(&self, conversation_id: &str, chunks: &[Chunk]) -> EngineResult<()> {
        let mut store = self.store.write().unwrap();
        let entry = store.entry(conversation_id.to_string()).or_default();
        for chunk in chunks {
            entry.insert(chunk.chunk_id.clone(), chunk.clone());
        }
        Ok(())
    }

    async fn query(
        &self,
        conversation_id: &str,
        key: QueryKey<'_>,
        k: usize,
    ) -> EngineResult<Vec<ScoredChunk>> {
        let store = self.store.read().unwrap();
        let Some(chunks) = store.get(conversation_id) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<ScoredChunk> = match key {
            QueryKey::Text(query) => {
                let query_lower = query.to_lowercase();
                let terms: Vec<&str> = query_lower.split_whitespace().collect();
                if terms.is_empty() {
                    return Ok(Vec::new());
                }
                chunks
                    .values()
                    .filter_map(|c| {
                        let text_lower = c.text.to_lowercase();
                        let matches = terms.iter().filter(|t| text_lower.contains(*t)).count();
                        if matches == 0 {
                            return None;
                        }
                        Some(ScoredChunk {
                            chunk: c.clone(),
                            score: matches as f64 / terms.len() as f64,
                        })
                    })
                    .collect()
            }
            QueryKey::Embedding(query_vec) => chunks
                .values()
                .filter_map(|c| {
                    let stored = c.embedding.as_ref()?;
                    let sim = cosine_similarity(query_vec, stored) as f64;
                    Some(ScoredChunk {
                        chunk: c.clone(),
                        // Cosine lands in [-1, 1]; shift into the score
                        // contract.
                        score: ((sim + 1.0) / 2.0).clamp(0.0, 1.0),
                    })
                })
                .collect(),
        };
        rank(&mut scored, k);
        Ok(scored)
    }

    async fn drop_conversation(&self, conversation_id: &str) -> EngineResult<()> {
        self.store.write().unwrap().remove(conversation_id);
        Ok(())
    }

    async fn probe(&self) -> EngineResult<()> {
        Ok(())
    }
}

/// Sort by score descending, break ties by lower first line, truncate.
fn rank(scored: &mut Vec<ScoredChunk>, k: usize) {
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.chunk.line_span.0.cmp(&b.chunk.line_span.0))
    });
    scored.truncate(k);
}

// ============ HTTP backend ============

/// OpenSearch-style HTTP vector index.
pub struct HttpVectorIndex {
    client: reqwest::Client,
    endpoint: String,
    index: String,
    auth: Option<(String, String)>,
}

impl HttpVectorIndex {
    pub fn new(config: &VectorConfig) -> EngineResult<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| EngineError::Internal("vector.endpoint required".to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let auth = match (&config.username, &config.password) {
            (Some(u), Some(p)) => Some((u.clone(), p.clone())),
            _ => None,
        };
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            index: config.index.clone(),
            auth,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let req = self
            .client
            .request(method, format!("{}{}", self.endpoint, path));
        match &self.auth {
            Some((user, pass)) => req.basic_auth(user, Some(pass)),
            None => req,
        }
    }

    fn unavailable(reason: impl Into<String>) -> EngineError {
        EngineError::DependencyUnavailable {
            service: "vector",
            reason: reason.into(),
        }
    }

    fn search_body(conversation_id: &str, key: QueryKey<'_>, k: usize) -> serde_json::Value {
        let conversation_filter =
            serde_json::json!({ "term": { "metadata.conversation_id": conversation_id } });
        let relevance = match key {
            QueryKey::Text(query) => serde_json::json!({
                "multi_match": {
                    "query": query,
                    "fields": ["text^2"],
                    "type": "best_fields",
                    "fuzziness": "AUTO"
                }
            }),
            QueryKey::Embedding(vector) => serde_json::json!({
                "knn": {
                    "vector_field": {
                        "vector": vector,
                        "k": k
                    }
                }
            }),
        };
        serde_json::json!({
            "size": k,
            "query": {
                "bool": {
                    "must": [conversation_filter, relevance]
                }
            },
            "_source": ["text", "metadata"]
        })
    }
}

#[async_trait]
impl VectorIndex for HttpVectorIndex {
    async fn upsert(&self, conversation_id: &str, chunks: &[Chunk]) -> EngineResult<()> {
        for chunk in chunks {
            let mut doc = serde_json::json!({
                "text": chunk.text,
                "metadata": {
                    "conversation_id": conversation_id,
                    "chunk_id": chunk.chunk_id,
                    "line_first": chunk.line_span.0,
                    "line_last": chunk.line_span.1,
                }
            });
            if let Some(emb) = &chunk.embedding {
                doc["vector_field"] = serde_json::json!(emb);
            }

            let resp = self
                .request(
                    reqwest::Method::PUT,
                    &format!("/{}/_doc/{}", self.index, chunk.chunk_id),
                )
                .json(&doc)
                .send()
                .await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(Self::unavailable(format!("upsert {}: {}", status, body)));
            }
        }
        Ok(())
    }

    async fn query(
        &self,
        conversation_id: &str,
        key: QueryKey<'_>,
        k: usize,
    ) -> EngineResult<Vec<ScoredChunk>> {
        let body = Self::search_body(conversation_id, key, k);

        let resp = self
            .request(reqwest::Method::POST, &format!("/{}/_search", self.index))
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(Self::unavailable(format!("query {}: {}", status, text)));
        }

        let json: serde_json::Value = resp.json().await.map_err(EngineError::from)?;
        let hits = json["hits"]["hits"].as_array().cloned().unwrap_or_default();

        let mut raw: Vec<(f64, Chunk)> = Vec::with_capacity(hits.len());
        for hit in &hits {
            let source = &hit["_source"];
            let meta = &source["metadata"];
            // Hits from other conversations would be a backend fault;
            // drop them rather than leak.
            if meta["conversation_id"].as_str() != Some(conversation_id) {
                continue;
            }
            let text = source["text"].as_str().unwrap_or_default().to_string();
            let first = meta["line_first"].as_u64().unwrap_or(0) as u32;
            let last = meta["line_last"].as_u64().unwrap_or(first as u64) as u32;
            let score = hit["_score"].as_f64().unwrap_or(0.0);
            raw.push((
                score,
                Chunk {
                    chunk_id: meta["chunk_id"].as_str().unwrap_or_default().to_string(),
                    conversation_id: conversation_id.to_string(),
                    line_span: (first, last),
                    text,
                    embedding: None,
                },
            ));
        }

        // Min-max normalize backend scores into [0, 1].
        let min = raw.iter().map(|(s, _)| *s).fold(f64::INFINITY, f64::min);
        let max = raw
            .iter()
            .map(|(s, _)| *s)
            .fold(f64::NEG_INFINITY, f64::max);
        let mut scored: Vec<ScoredChunk> = raw
            .into_iter()
            .map(|(s, chunk)| {
                let score = if (max - min).abs() < f64::EPSILON {
                    1.0
                } else {
                    (s - min) / (max - min)
                };
                ScoredChunk { chunk, score }
            })
            .collect();
        rank(&mut scored, k);
        Ok(scored)
    }

    async fn drop_conversation(&self, conversation_id: &str) -> EngineResult<()> {
        let body = serde_json::json!({
            "query": { "term": { "metadata.conversation_id": conversation_id } }
        });
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("/{}/_delete_by_query", self.index),
            )
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(Self::unavailable(format!("drop {}: {}", status, text)));
        }
        Ok(())
    }

    async fn probe(&self) -> EngineResult<()> {
        let resp = self.request(reqwest::Method::GET, "").send().await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Self::unavailable(format!("probe {}", resp.status())))
        }
    }
}
