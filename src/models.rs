//! Core data models used throughout the extraction engine.
//!
//! These types represent the transcript lines, chunks, term candidates,
//! concept mappings, and section results that flow through the pipeline.
//! The data lifecycle is:
//!
//! ```text
//! raw text → normalize() → LineRecord → chunk() → Chunk
//!                                          ↓
//!                              extract_terms() → TermCandidate
//!                                          ↓
//!                                 resolve() → ConceptMapping
//!                                          ↓
//!                   generate section → SectionResult → publish()
//! ```
//!
//! # Type relationships
//!
//! - A **[`LineRecord`]** is one line of the normalized transcript with a
//!   stable line number and byte offsets into the original input.
//! - A **[`Chunk`]** is a window of consecutive lines, indexed per
//!   conversation for similarity retrieval.
//! - A **[`TermCandidate`]** is a deduplicated medical term with its
//!   verified occurrences in the transcript.
//! - A **[`ConceptMapping`]** links a term to a clinical ontology concept.
//! - A **[`SectionResult`]** is the primary output unit: generated content
//!   plus the line references and concept mappings that ground it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Speaker attribution for a transcript line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Doctor,
    Patient,
    Other,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Speaker::Doctor => "doctor",
            Speaker::Patient => "patient",
            Speaker::Other => "other",
        }
    }
}

/// One line of the normalized transcript.
///
/// Line numbers are 1-based and dense; byte offsets refer to the UTF-8
/// encoding of the original input and stay stable for the lifetime of the
/// conversation. `text` never contains line separators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineRecord {
    /// 1-based line number, strictly increasing.
    pub line_no: u32,
    /// Speaker detected from the line prefix, if any.
    pub speaker: Option<Speaker>,
    /// Line text with trailing whitespace trimmed.
    pub text: String,
    /// Byte offset of the line start in the original input.
    pub byte_start: usize,
    /// Byte offset one past the line end in the original input.
    pub byte_end: usize,
}

/// A window of consecutive transcript lines, indexed for retrieval.
///
/// Chunks may overlap; every line of the transcript is covered by at least
/// one chunk. The id is a stable hash of the conversation, line span, and
/// text so that repeated upserts are idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Stable content hash identifying this chunk.
    pub chunk_id: String,
    /// Conversation this chunk belongs to. Retrieval never crosses it.
    pub conversation_id: String,
    /// First and last line number covered, inclusive.
    pub line_span: (u32, u32),
    /// Chunk text: the covered lines joined by newlines, numbered.
    pub text: String,
    /// Embedding vector, present once the chunk has been embedded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Chunk {
    /// Build a chunk with its deterministic id.
    pub fn new(conversation_id: &str, line_span: (u32, u32), text: String) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(conversation_id.as_bytes());
        hasher.update(line_span.0.to_le_bytes());
        hasher.update(line_span.1.to_le_bytes());
        hasher.update(text.as_bytes());
        let chunk_id = format!("{:x}", hasher.finalize());
        Self {
            chunk_id,
            conversation_id: conversation_id.to_string(),
            line_span,
            text,
            embedding: None,
        }
    }
}

/// A chunk returned from retrieval with its similarity score in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f64,
}

/// A single verified occurrence of a term in the transcript.
///
/// Char offsets are Unicode-scalar indices into the referenced line's text,
/// half-open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermOccurrence {
    pub line_no: u32,
    pub char_start: usize,
    pub char_end: usize,
}

/// A candidate medical term extracted from the transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TermCandidate {
    /// Term as it appears in the transcript.
    pub surface: String,
    /// Normalized form used for deduplication and ontology lookup.
    pub normalized: String,
    /// Verified occurrences; always at least one after verification.
    pub occurrences: Vec<TermOccurrence>,
}

/// How an ontology concept was matched to a term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    Contains,
    Semantic,
}

/// A link between a transcript term and a clinical ontology concept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptMapping {
    pub original_term: String,
    pub concept_id: String,
    pub preferred_term: String,
    pub language: String,
    /// Calibrated match confidence in `[0, 1]`, monotone in match quality.
    pub confidence: f64,
    pub match_kind: MatchKind,
}

/// Known clinical section types plus a caller-defined escape hatch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionType {
    Subjective,
    Objective,
    Assessment,
    Plan,
    VisitSummary,
    Referral,
    /// Caller-defined section; the string is the caller's type label.
    Custom(String),
}

impl SectionType {
    /// Parse a section type label from a request. Unrecognized labels map
    /// to [`SectionType::Custom`]; an empty label is invalid.
    pub fn parse(label: &str) -> Option<Self> {
        let trimmed = label.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(match trimmed.to_ascii_lowercase().as_str() {
            "subjective" => SectionType::Subjective,
            "objective" => SectionType::Objective,
            "assessment" => SectionType::Assessment,
            "plan" => SectionType::Plan,
            "visit_summary" | "visit-summary" | "visitsummary" => SectionType::VisitSummary,
            "referral" => SectionType::Referral,
            _ => SectionType::Custom(trimmed.to_string()),
        })
    }

    /// Retrieval keywords appended to the section prompt when querying the
    /// vector index.
    pub fn retrieval_keywords(&self) -> &str {
        match self {
            SectionType::Subjective => "symptoms complaint history patient reports",
            SectionType::Objective => "examination findings vitals measurements results",
            SectionType::Assessment => "diagnosis impression assessment condition",
            SectionType::Plan => "treatment plan medication follow-up referral",
            SectionType::VisitSummary => "visit summary overview encounter",
            SectionType::Referral => "referral specialist consultation",
            SectionType::Custom(label) => label,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            SectionType::Subjective => "subjective",
            SectionType::Objective => "objective",
            SectionType::Assessment => "assessment",
            SectionType::Plan => "plan",
            SectionType::VisitSummary => "visit_summary",
            SectionType::Referral => "referral",
            SectionType::Custom(label) => label,
        }
    }
}

/// One section to generate, resolved from a requested template.
///
/// `depends_on` names other sections of the same template group whose
/// accepted content is fed into this section's prompt. The dependency graph
/// is validated acyclic at intake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionSpec {
    pub template_id: String,
    pub section_id: String,
    pub section_type: SectionType,
    pub prompt: String,
    pub order_index: u32,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// An exact reference into the stored transcript.
///
/// `start`/`end` are Unicode-scalar indices into the referenced line's
/// text, half-open; `text` must equal that substring under NFC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineReference {
    pub line: u32,
    pub start: usize,
    pub end: usize,
    pub text: String,
}

/// Terminal validation outcome of a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Accepted,
    FailedValidation,
    Error,
}

/// A generated section with its grounding evidence.
///
/// This is the primary output unit. Every reference resolves to the stored
/// transcript; every medical entity in `content` is covered by
/// `snomed_mappings` or the job's global mappings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionResult {
    pub section_id: String,
    pub content: String,
    pub line_references: Vec<LineReference>,
    pub snomed_mappings: Vec<ConceptMapping>,
    /// Blended confidence in `[0, 1]`: `min(llm self-score, citation pass
    /// ratio)`, scaled down when ontology resolution was partial.
    pub confidence: f64,
    pub language: String,
    pub validation_status: ValidationStatus,
}

/// Per-section lifecycle state tracked by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionState {
    Pending,
    Retrieving,
    Generating,
    Validating,
    Retrying,
    Accepted,
    FailedValidation,
    Error,
    DeliveryFailed,
}

impl SectionState {
    /// A section in a terminal state never transitions again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SectionState::Accepted
                | SectionState::FailedValidation
                | SectionState::Error
                | SectionState::DeliveryFailed
        )
    }
}

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Cancelled,
    Completed,
    PartiallyFailed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

/// Snapshot of a job's progress, returned by the status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub conversation_id: String,
    pub template_group_id: String,
    pub status: JobStatus,
    pub section_states: Vec<(String, SectionState)>,
    pub started_at: DateTime<Utc>,
}

/// A stored terminology preference for one original term.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreferenceEntry {
    pub preferred: String,
    /// Confidence in `[0, 1]`; entries below the apply threshold are
    /// ignored at generation time.
    pub confidence: f64,
    pub last_updated: DateTime<Utc>,
}

/// Timing and provenance metadata attached to each published payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingMetadata {
    pub duration_ms: u64,
    pub attempts: u32,
    pub chunks_retrieved: usize,
    pub model: String,
}

/// The payload delivered to the publication sink for each section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionPayload {
    pub template_type: String,
    pub section_type: String,
    pub section_id: String,
    pub section_content: String,
    pub line_references: Vec<LineReference>,
    pub snomed_mappings: Vec<ConceptMapping>,
    pub confidence_score: f64,
    pub extracted_language: String,
    pub processing_metadata: ProcessingMetadata,
    pub validation_status: ValidationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
