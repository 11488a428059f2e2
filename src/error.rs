//! Engine error taxonomy.
//!
//! Every failure that can cross a component boundary is one of these
//! variants. Only [`EngineError::DependencyUnavailable`],
//! [`EngineError::LlmInvalidOutput`], and [`EngineError::CitationFailure`]
//! are retryable; everything else surfaces immediately.

use thiserror::Error;

/// Errors produced by the extraction pipeline.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed request: unknown section type, cyclic dependency, missing
    /// required field. Surfaced synchronously, before a job exists.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Empty or oversize transcript.
    #[error("invalid transcript: {0}")]
    InvalidTranscript(String),

    /// A backing service (vector index, ontology, LLM) is reachable but
    /// failing, or unreachable.
    #[error("dependency unavailable: {service}: {reason}")]
    DependencyUnavailable { service: &'static str, reason: String },

    /// The model returned output that could not be parsed or violates the
    /// expected schema.
    #[error("LLM returned invalid output: {0}")]
    LlmInvalidOutput(String),

    /// The citation validator rejected one or more references.
    #[error("citation validation failed: {0}")]
    CitationFailure(String),

    /// The publisher exhausted its delivery retries.
    #[error("delivery failed for section {section_id}: {reason}")]
    DeliveryFailure { section_id: String, reason: String },

    /// Cooperative cancellation was observed.
    #[error("cancelled")]
    Cancelled,

    /// Programming error or unexpected condition.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether the orchestrator may retry the operation that produced this
    /// error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::DependencyUnavailable { .. }
                | EngineError::LlmInvalidOutput(_)
                | EngineError::CitationFailure(_)
        )
    }

    /// Short machine-readable code used in HTTP error envelopes and
    /// publication payloads.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidRequest(_) => "invalid_request",
            EngineError::InvalidTranscript(_) => "invalid_transcript",
            EngineError::DependencyUnavailable { .. } => "dependency_unavailable",
            EngineError::LlmInvalidOutput(_) => "llm_invalid_output",
            EngineError::CitationFailure(_) => "citation_failure",
            EngineError::DeliveryFailure { .. } => "delivery_failure",
            EngineError::Cancelled => "cancelled",
            EngineError::Internal(_) => "internal",
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        EngineError::DependencyUnavailable {
            service: "http",
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::LlmInvalidOutput(e.to_string())
    }
}

/// Convenience alias used throughout the engine.
pub type EngineResult<T> = Result<T, EngineError>;
