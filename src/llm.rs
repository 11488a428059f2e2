//! LLM client.
//!
//! The [`LlmClient`] trait abstracts prompted generation with two calling
//! modes: *deterministic* (temperature 0, JSON output) for extraction and
//! the validation judge, and *compositional* (low temperature, structured
//! output) for section generation.
//!
//! [`OpenAiCompatClient`] speaks the chat-completions wire shape against
//! any OpenAI-compatible endpoint. Timeouts, bounded retries with
//! exponential backoff and jitter, and error classification live here;
//! callers see [`EngineError::DependencyUnavailable`] for transport/server
//! failures and [`EngineError::LlmInvalidOutput`] for unparsable output.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::config::LlmConfig;
use crate::error::{EngineError, EngineResult};

/// How a prompt should be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    /// Temperature 0, JSON output schema enforced.
    Deterministic,
    /// Low temperature, structured output for composition.
    Compositional,
}

/// Capability interface over the model.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Run a prompt expecting a JSON object (or array) back.
    async fn complete_json(
        &self,
        system: &str,
        user: &str,
        mode: CallMode,
    ) -> EngineResult<serde_json::Value>;

    /// Run a prompt expecting free text back.
    async fn complete_text(&self, system: &str, user: &str, mode: CallMode)
        -> EngineResult<String>;

    /// Model identifier recorded in processing metadata.
    fn model_name(&self) -> &str;

    /// Cheap liveness probe used by the health endpoint.
    async fn probe(&self) -> EngineResult<()>;
}

/// Strip markdown code fences (```json ... ```) the model sometimes wraps
/// around its output.
pub fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim()
}

/// Client for an OpenAI-compatible chat-completions endpoint.
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    temperature: f32,
    max_attempts: u32,
    backoff_cap: Duration,
    api_key: Option<String>,
}

impl OpenAiCompatClient {
    pub fn new(config: &LlmConfig) -> EngineResult<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_attempts: config.max_attempts.max(1),
            backoff_cap: Duration::from_secs(config.backoff_cap_secs),
            api_key: std::env::var("OPENAI_API_KEY").ok(),
        })
    }

    fn temperature_for(&self, mode: CallMode) -> f32 {
        match mode {
            CallMode::Deterministic => 0.0,
            CallMode::Compositional => self.temperature.min(0.3),
        }
    }

    /// Exponential backoff with jitter: `2^(attempt-1)` seconds plus up to
    /// half that again, capped.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = Duration::from_secs(1 << (attempt - 1).min(5));
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
        (base + Duration::from_millis(jitter_ms)).min(self.backoff_cap)
    }

    async fn chat(&self, system: &str, user: &str, mode: CallMode, json: bool) -> EngineResult<String> {
        let mut body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature_for(mode),
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user }
            ]
        });
        if json {
            body["response_format"] = serde_json::json!({ "type": "json_object" });
        }

        let mut last_err: Option<EngineError> = None;

        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.backoff(attempt - 1)).await;
            }

            let mut req = self
                .client
                .post(format!("{}/chat/completions", self.endpoint))
                .json(&body);
            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key);
            }

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let json: serde_json::Value =
                            resp.json().await.map_err(EngineError::from)?;
                        let content = json["choices"][0]["message"]["content"]
                            .as_str()
                            .ok_or_else(|| {
                                EngineError::LlmInvalidOutput(
                                    "response carried no message content".to_string(),
                                )
                            })?;
                        return Ok(content.to_string());
                    }

                    let text = resp.text().await.unwrap_or_default();
                    let err = EngineError::DependencyUnavailable {
                        service: "llm",
                        reason: format!("{}: {}", status, text),
                    };
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or(EngineError::DependencyUnavailable {
            service: "llm",
            reason: "exhausted retries".to_string(),
        }))
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn complete_json(
        &self,
        system: &str,
        user: &str,
        mode: CallMode,
    ) -> EngineResult<serde_json::Value> {
        let content = self.chat(system, user, mode, true).await?;
        let cleaned = strip_code_fences(&content);
        serde_json::from_str(cleaned)
            .map_err(|e| EngineError::LlmInvalidOutput(format!("{}: {}", e, cleaned)))
    }

    async fn complete_text(
        &self,
        system: &str,
        user: &str,
        mode: CallMode,
    ) -> EngineResult<String> {
        self.chat(system, user, mode, false).await
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn probe(&self) -> EngineResult<()> {
        let mut req = self.client.get(format!("{}/models", self.endpoint));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(EngineError::DependencyUnavailable {
                service: "llm",
                reason: format!("probe {}", resp.status()),
            })
        }
    }
}
