//! Result publisher.
//!
//! Delivers each terminal section payload to the configured sink exactly
//! once. Delivery retries are at-least-once; the sink sees at most one
//! effective publication per `section_id` because publishers deduplicate
//! on it (and HTTP delivery carries it as an idempotency key).
//!
//! Sinks:
//! - **[`ChannelPublisher`]** — in-process mpsc stream, used by the CLI
//!   `process` command and by tests.
//! - **[`HttpCallbackPublisher`]** — POSTs each payload to the gateway
//!   callback URL with bounded retries.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::PublisherConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::SectionPayload;

/// Capability interface over the publication sink.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Deliver one section payload. Implementations are idempotent per
    /// `section_id`: a repeated publish is a no-op success.
    async fn publish(&self, payload: &SectionPayload) -> EngineResult<()>;
}

// ============ Channel sink ============

/// Streams payloads over an in-process channel.
pub struct ChannelPublisher {
    tx: mpsc::UnboundedSender<SectionPayload>,
    delivered: Mutex<HashSet<String>>,
}

impl ChannelPublisher {
    /// Returns the publisher and the receiving end of the stream.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SectionPayload>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                delivered: Mutex::new(HashSet::new()),
            },
            rx,
        )
    }
}

#[async_trait]
impl Publisher for ChannelPublisher {
    async fn publish(&self, payload: &SectionPayload) -> EngineResult<()> {
        {
            let mut delivered = self.delivered.lock().unwrap();
            if !delivered.insert(payload.section_id.clone()) {
                warn!(section = %payload.section_id, "duplicate publish suppressed");
                return Ok(());
            }
        }
        self.tx
            .send(payload.clone())
            .map_err(|_| EngineError::DeliveryFailure {
                section_id: payload.section_id.clone(),
                reason: "stream receiver dropped".to_string(),
            })
    }
}

// ============ HTTP callback sink ============

/// POSTs payloads to the gateway callback URL.
pub struct HttpCallbackPublisher {
    client: reqwest::Client,
    url: String,
    max_retries: u32,
    delivered: Mutex<HashSet<String>>,
}

impl HttpCallbackPublisher {
    pub fn new(config: &PublisherConfig) -> EngineResult<Self> {
        let url = config
            .callback_url
            .clone()
            .ok_or_else(|| EngineError::Internal("publisher.callback_url required".to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url,
            max_retries: config.max_retries,
            delivered: Mutex::new(HashSet::new()),
        })
    }
}

#[async_trait]
impl Publisher for HttpCallbackPublisher {
    async fn publish(&self, payload: &SectionPayload) -> EngineResult<()> {
        {
            let delivered = self.delivered.lock().unwrap();
            if delivered.contains(&payload.section_id) {
                return Ok(());
            }
        }

        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1 << (attempt - 1).min(4))).await;
            }

            let resp = self
                .client
                .post(&self.url)
                .header("Idempotency-Key", &payload.section_id)
                .json(payload)
                .send()
                .await;

            match resp {
                Ok(response) if response.status().is_success() => {
                    self.delivered
                        .lock()
                        .unwrap()
                        .insert(payload.section_id.clone());
                    info!(section = %payload.section_id, "section delivered");
                    return Ok(());
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    last_err = Some(format!("{}: {}", status, body));
                    // Client errors other than 429 will not succeed on
                    // retry.
                    if status.is_client_error() && status.as_u16() != 429 {
                        break;
                    }
                }
                Err(e) => {
                    last_err = Some(e.to_string());
                }
            }
        }

        Err(EngineError::DeliveryFailure {
            section_id: payload.section_id.clone(),
            reason: last_err.unwrap_or_else(|| "delivery failed".to_string()),
        })
    }
}
