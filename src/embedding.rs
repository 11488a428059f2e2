//! Embedding provider.
//!
//! The [`EmbeddingProvider`] trait produces the vectors the ingest phase
//! attaches to chunks and the retrieval phase uses for semantic queries.
//! Two implementations:
//!
//! - **[`DisabledProvider`]** — embeddings off; ingest indexes chunks
//!   without vectors and retrieval falls back to text queries.
//! - **[`OpenAiEmbeddingProvider`]** — an OpenAI-compatible
//!   `/embeddings` endpoint, with doubling backoff on rate limits,
//!   server errors, and transport failures.
//!
//! [`cosine_similarity`] scores stored vectors in the in-memory index.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::EmbeddingConfig;
use crate::error::{EngineError, EngineResult};

/// Longest pause between embedding attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(16);

/// Capability interface over the embedding backend.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Vector dimensionality.
    fn dims(&self) -> usize;

    /// Whether this provider produces vectors at all. The pipeline skips
    /// embedding work entirely when this is false.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Embed a batch of texts, one vector per input in input order.
    async fn embed(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>>;
}

/// Build the provider the configuration names.
pub fn build_provider(config: &EmbeddingConfig) -> EngineResult<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "openai" => Ok(Arc::new(OpenAiEmbeddingProvider::new(config)?)),
        other => Err(EngineError::Internal(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

/// A no-op provider used when embeddings are not configured.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        0
    }

    fn is_enabled(&self) -> bool {
        false
    }

    async fn embed(&self, _texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        Err(EngineError::DependencyUnavailable {
            service: "embedding",
            reason: "embedding provider is disabled".to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

/// Provider for an OpenAI-compatible `/embeddings` endpoint.
pub struct OpenAiEmbeddingProvider {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
    api_key: String,
    max_retries: u32,
}

impl OpenAiEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> EngineResult<Self> {
        let model = config.model.clone().ok_or_else(|| {
            EngineError::Internal("embedding.model required for openai provider".to_string())
        })?;
        let dims = config.dims.ok_or_else(|| {
            EngineError::Internal("embedding.dims required for openai provider".to_string())
        })?;
        let api_key =
            std::env::var("OPENAI_API_KEY").map_err(|_| EngineError::DependencyUnavailable {
                service: "embedding",
                reason: "OPENAI_API_KEY not set".to_string(),
            })?;
        let url = config
            .endpoint
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1/embeddings".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url,
            model,
            dims,
            api_key,
            max_retries: config.max_retries.max(1),
        })
    }

    /// One request; the error carries whether a retry can help.
    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, (bool, EngineError)> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let resp = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| (true, e.into()))?;

        let status = resp.status();
        if status.is_success() {
            let parsed: EmbeddingResponse = resp.json().await.map_err(|e| {
                (
                    false,
                    EngineError::DependencyUnavailable {
                        service: "embedding",
                        reason: format!("malformed response: {}", e),
                    },
                )
            })?;
            return Ok(parsed.data.into_iter().map(|d| d.embedding).collect());
        }

        let retryable = status.as_u16() == 429 || status.is_server_error();
        let text = resp.text().await.unwrap_or_default();
        Err((
            retryable,
            EngineError::DependencyUnavailable {
                service: "embedding",
                reason: format!("{}: {}", status, text),
            },
        ))
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        let mut delay = Duration::from_millis(500);
        let mut last_err = None;

        for attempt in 0..self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_BACKOFF);
            }
            match self.request(texts).await {
                Ok(vectors) => return Ok(vectors),
                Err((true, e)) => last_err = Some(e),
                Err((false, e)) => return Err(e),
            }
        }

        Err(last_err.unwrap_or(EngineError::DependencyUnavailable {
            service: "embedding",
            reason: "embedding failed after retries".to_string(),
        }))
    }
}

/// Compute cosine similarity between two vectors.
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
