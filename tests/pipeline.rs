//! End-to-end pipeline tests.
//!
//! The engine runs against the in-memory vector index, the static
//! ontology, and a scripted LLM whose responses are keyed by markers
//! embedded in the section prompts. Section payloads are collected from
//! the channel publisher in completion order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use notegen::config::Config;
use notegen::embedding::{DisabledProvider, EmbeddingProvider};
use notegen::error::{EngineError, EngineResult};
use notegen::llm::{CallMode, LlmClient};
use notegen::models::{JobStatus, SectionPayload, SectionState, ValidationStatus};
use notegen::ontology::StaticOntologyClient;
use notegen::orchestrator::{EncounterRequest, Engine};
use notegen::preferences::PreferenceStore;
use notegen::publish::ChannelPublisher;
use notegen::registry::JobRegistry;
use notegen::templates::{SectionRequest, TemplateRequest};
use notegen::transcript::normalize;
use notegen::vector::MemoryVectorIndex;

// ============ Scripted LLM ============

/// Test double for the model. Term-extraction prompts return a fixed
/// response, consistency-judge prompts return a high score, and section
/// prompts are matched by a `PROMPT:<id>` marker and answered from a
/// per-section queue (the last entry repeats).
struct ScriptedLlm {
    terms: serde_json::Value,
    sections: Mutex<HashMap<String, Vec<serde_json::Value>>>,
    generation_calls: AtomicU32,
    blocked: Arc<AtomicBool>,
    /// When set, the gate only blocks calls carrying this marker;
    /// otherwise it blocks every section call.
    gated_marker: Option<String>,
}

impl ScriptedLlm {
    fn new(terms: serde_json::Value) -> Self {
        Self {
            terms,
            sections: Mutex::new(HashMap::new()),
            generation_calls: AtomicU32::new(0),
            blocked: Arc::new(AtomicBool::new(false)),
            gated_marker: None,
        }
    }

    fn respond(mut self, marker: &str, responses: Vec<serde_json::Value>) -> Self {
        self.sections
            .get_mut()
            .unwrap()
            .insert(marker.to_string(), responses);
        self
    }

    fn gated_on(mut self, marker: &str) -> Self {
        self.gated_marker = Some(marker.to_string());
        self
    }

    fn gate(&self) -> Arc<AtomicBool> {
        self.blocked.clone()
    }

    fn calls(&self) -> u32 {
        self.generation_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete_json(
        &self,
        system: &str,
        user: &str,
        _mode: CallMode,
    ) -> EngineResult<serde_json::Value> {
        if system.contains("terminologist") {
            return Ok(self.terms.clone());
        }
        if system.contains("fact-checker") {
            return Ok(json!({ "factualConsistencyScore": 9, "issuesFound": [] }));
        }

        let marker = {
            let sections = self.sections.lock().unwrap();
            sections
                .keys()
                .find(|marker| user.contains(marker.as_str()))
                .cloned()
                .ok_or_else(|| EngineError::LlmInvalidOutput(format!("no script for: {}", user)))?
        };

        let gated = self
            .gated_marker
            .as_ref()
            .map(|m| m == &marker)
            .unwrap_or(true);
        while gated && self.blocked.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.generation_calls.fetch_add(1, Ordering::SeqCst);

        let mut sections = self.sections.lock().unwrap();
        let queue = sections.get_mut(&marker).unwrap();
        let value = if queue.len() > 1 {
            queue.remove(0)
        } else {
            queue[0].clone()
        };
        Ok(value)
    }

    async fn complete_text(
        &self,
        _system: &str,
        _user: &str,
        _mode: CallMode,
    ) -> EngineResult<String> {
        Ok("ok".to_string())
    }

    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn probe(&self) -> EngineResult<()> {
        Ok(())
    }
}

// ============ Fixtures ============

const TRANSCRIPT: &str = "Doctor: What brings you in today?\n\
Patient: I have chest pain and my hypertension has been acting up.\n\
Doctor: Any shortness of breath?\n\
Patient: Yes, especially when climbing stairs.";

fn english_terms() -> serde_json::Value {
    json!({
        "terms": [
            {
                "surface": "chest pain",
                "normalized": "chest pain",
                "occurrences": [{ "line_no": 2, "char_start": 16, "char_end": 26 }]
            },
            {
                "surface": "hypertension",
                "normalized": "hypertension",
                "occurrences": [{ "line_no": 2, "char_start": 0, "char_end": 5 }]
            },
            {
                "surface": "shortness of breath",
                "normalized": "shortness of breath",
                "occurrences": [{ "line_no": 3, "char_start": 12, "char_end": 31 }]
            }
        ]
    })
}

/// A well-grounded section answer citing line 2 of [`TRANSCRIPT`].
fn good_section(content: &str) -> serde_json::Value {
    json!({
        "noteContent": content,
        "lineReferences": [
            { "line": 2, "start": 16, "end": 26, "text": "chest pain" }
        ],
        "medicalTerms": ["chest pain"],
        "selfConfidence": 0.9
    })
}

fn section(id: &str, section_type: &str, deps: &[&str]) -> SectionRequest {
    SectionRequest {
        section_id: id.to_string(),
        section_type: section_type.to_string(),
        prompt: format!("PROMPT:{} extract the relevant findings", id),
        depends_on: deps.iter().map(|d| d.to_string()).collect(),
    }
}

fn soap_template() -> TemplateRequest {
    TemplateRequest {
        template_id: "soap".to_string(),
        sections: vec![
            section("s", "subjective", &[]),
            section("o", "objective", &[]),
            section("a", "assessment", &["s", "o"]),
            section("p", "plan", &["a"]),
        ],
    }
}

fn summary_template() -> TemplateRequest {
    TemplateRequest {
        template_id: "visit_summary".to_string(),
        sections: vec![
            section("vs1", "visit_summary", &[]),
            section("vs2", "visit_summary", &[]),
        ],
    }
}

fn request(conversation_id: &str, templates: Vec<TemplateRequest>) -> EncounterRequest {
    EncounterRequest {
        conversation_id: conversation_id.to_string(),
        templates,
        transcription_text: Some(TRANSCRIPT.to_string()),
        transcript_turns: None,
        doctor_id: "dr-1".to_string(),
        doctor_preferences: HashMap::new(),
        language: Some("en".to_string()),
    }
}

fn engine_with(
    llm: Arc<dyn LlmClient>,
) -> (
    Arc<Engine>,
    tokio::sync::mpsc::UnboundedReceiver<SectionPayload>,
    Arc<JobRegistry>,
) {
    let (publisher, rx) = ChannelPublisher::new();
    let engine = Arc::new(Engine::new(
        Config::minimal(),
        Arc::new(MemoryVectorIndex::new()),
        Arc::new(StaticOntologyClient::with_default_concepts()),
        llm,
        Arc::new(DisabledProvider),
        Arc::new(publisher),
        Arc::new(PreferenceStore::ephemeral()),
    ));
    let registry = engine.registry();
    (engine, rx, registry)
}

async fn collect_payloads(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<SectionPayload>,
    count: usize,
) -> Vec<SectionPayload> {
    let mut payloads = Vec::new();
    for _ in 0..count {
        let payload = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for payload")
            .expect("publisher dropped");
        payloads.push(payload);
    }
    payloads
}

async fn wait_terminal(registry: &JobRegistry, job_id: &str) -> JobStatus {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(snapshot) = registry.snapshot(job_id) {
                if snapshot.status.is_terminal() {
                    return snapshot.status;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("job never reached a terminal state")
}

fn position(payloads: &[SectionPayload], section_id: &str) -> usize {
    payloads
        .iter()
        .position(|p| p.section_id == section_id)
        .unwrap_or_else(|| panic!("section '{}' was not published", section_id))
}

// ============ Scenarios ============

#[tokio::test]
async fn two_templates_share_one_transcript() {
    let llm = ScriptedLlm::new(english_terms())
        .respond("PROMPT:s", vec![good_section("Patient reports chest pain.")])
        .respond("PROMPT:o", vec![good_section("Exertional dyspnea observed.")])
        .respond("PROMPT:a", vec![good_section("Likely angina; hypertension.")])
        .respond("PROMPT:p", vec![good_section("Order ECG and adjust medication.")])
        .respond("PROMPT:vs1", vec![good_section("Visit for chest pain.")])
        .respond("PROMPT:vs2", vec![good_section("Follow-up recommended.")]);

    let (engine, mut rx, registry) = engine_with(Arc::new(llm));
    let job_id = engine
        .submit(request("conv-1", vec![soap_template(), summary_template()]))
        .await
        .unwrap();

    let payloads = collect_payloads(&mut rx, 6).await;
    assert_eq!(wait_terminal(&registry, &job_id).await, JobStatus::Completed);

    // Dependency order: A after S and O, P after A. S/O/VS1/VS2 may
    // interleave freely.
    assert!(position(&payloads, "a") > position(&payloads, "s"));
    assert!(position(&payloads, "a") > position(&payloads, "o"));
    assert!(position(&payloads, "p") > position(&payloads, "a"));

    // All published sections are accepted and every reference resolves.
    let (lines, _) = normalize(TRANSCRIPT, Some("en"), 1 << 20).unwrap();
    for payload in &payloads {
        assert_eq!(payload.validation_status, ValidationStatus::Accepted);
        for reference in &payload.line_references {
            let line = lines.iter().find(|l| l.line_no == reference.line).unwrap();
            let substring: String = line
                .text
                .chars()
                .skip(reference.start)
                .take(reference.end - reference.start)
                .collect();
            assert_eq!(substring, reference.text);
        }
    }

    // Template grouping is preserved on the payloads.
    assert_eq!(payloads[position(&payloads, "vs1")].template_type, "visit_summary");
    assert_eq!(payloads[position(&payloads, "s")].template_type, "soap");
}

#[tokio::test]
async fn missing_citation_retries_then_fails_validation() {
    let bad = json!({
        "noteContent": "Patient has a fracture.",
        "lineReferences": [
            { "line": 999, "start": 0, "end": 8, "text": "fracture" }
        ],
        "medicalTerms": [],
        "selfConfidence": 0.9
    });
    let template = TemplateRequest {
        template_id: "soap".to_string(),
        sections: vec![section("s", "subjective", &[])],
    };
    let llm = ScriptedLlm::new(english_terms()).respond("PROMPT:s", vec![bad]);
    let llm = Arc::new(llm);

    let (engine, mut rx, registry) = engine_with(llm.clone());
    let job_id = engine.submit(request("conv-2", vec![template])).await.unwrap();

    let payloads = collect_payloads(&mut rx, 1).await;
    assert_eq!(wait_terminal(&registry, &job_id).await, JobStatus::Failed);

    assert_eq!(payloads[0].section_id, "s");
    assert_eq!(payloads[0].validation_status, ValidationStatus::FailedValidation);
    let error = payloads[0].error.as_deref().unwrap();
    assert!(error.contains("references failed"), "error: {}", error);
    // Three generation attempts were made before giving up.
    assert_eq!(llm.calls(), 3);
}

#[tokio::test]
async fn cancellation_mid_job_keeps_published_sections() {
    let llm = ScriptedLlm::new(english_terms())
        .respond("PROMPT:s", vec![good_section("Patient reports chest pain.")])
        .respond("PROMPT:o", vec![good_section("Never returned.")])
        .respond("PROMPT:a", vec![good_section("Never runs.")])
        .respond("PROMPT:p", vec![good_section("Never runs.")])
        .gated_on("PROMPT:o");
    let gate = llm.gate();
    gate.store(true, std::sync::atomic::Ordering::SeqCst);
    let llm = Arc::new(llm);

    let (engine, mut rx, registry) = engine_with(llm.clone());

    // S answers immediately; O blocks on its gate until cancelled.
    let job_id = engine.submit(request("conv-3", vec![soap_template()])).await.unwrap();

    // Wait for S to be published, then cancel while O is still in
    // flight.
    let first = collect_payloads(&mut rx, 1).await;
    assert_eq!(first[0].section_id, "s");
    assert!(registry.cancel(&job_id));

    assert_eq!(wait_terminal(&registry, &job_id).await, JobStatus::Cancelled);

    // Nothing else is published: O was cancelled in flight, A and P
    // never started.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(rx.try_recv().is_err(), "no further publications after cancel");

    let snapshot = registry.snapshot(&job_id).unwrap();
    let state_of = |id: &str| {
        snapshot
            .section_states
            .iter()
            .find(|(sid, _)| sid == id)
            .map(|(_, s)| *s)
            .unwrap()
    };
    assert_eq!(state_of("s"), SectionState::Accepted);
    assert_eq!(state_of("a"), SectionState::Pending);
    assert_eq!(state_of("p"), SectionState::Pending);
}

#[tokio::test]
async fn duplicate_submission_cancels_first_job() {
    let llm = ScriptedLlm::new(english_terms())
        .respond("PROMPT:s", vec![good_section("Patient reports chest pain.")])
        .respond("PROMPT:o", vec![good_section("Dyspnea on exertion.")])
        .respond("PROMPT:a", vec![good_section("Angina suspected.")])
        .respond("PROMPT:p", vec![good_section("ECG ordered.")]);
    let gate = llm.gate();
    let llm = Arc::new(llm);

    let (engine, mut rx, registry) = engine_with(llm.clone());

    // First job blocks before any section can generate.
    gate.store(true, std::sync::atomic::Ordering::SeqCst);
    let first = engine.submit(request("conv-4", vec![soap_template()])).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Second submission for the same (conversation, template group)
    // supersedes the first.
    let second = engine.submit(request("conv-4", vec![soap_template()])).await.unwrap();
    assert_ne!(first, second);
    assert_eq!(registry.snapshot(&first).unwrap().status, JobStatus::Cancelled);

    gate.store(false, std::sync::atomic::Ordering::SeqCst);
    let payloads = collect_payloads(&mut rx, 4).await;
    assert_eq!(wait_terminal(&registry, &second).await, JobStatus::Completed);

    // No section id is published twice across the two jobs.
    let mut ids: Vec<&str> = payloads.iter().map(|p| p.section_id.as_str()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 4);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn doctor_preferences_shape_content_and_keep_canonical_mapping() {
    let preferred = json!({
        "noteContent": "Chest pain with known HTN.",
        "lineReferences": [
            { "line": 2, "start": 16, "end": 26, "text": "chest pain" }
        ],
        "medicalTerms": ["chest pain", "hypertension"],
        "selfConfidence": 0.9
    });
    let template = TemplateRequest {
        template_id: "soap".to_string(),
        sections: vec![section("s", "subjective", &[])],
    };
    let llm = ScriptedLlm::new(english_terms()).respond("PROMPT:s", vec![preferred]);

    let (engine, mut rx, registry) = engine_with(Arc::new(llm));
    let mut req = request("conv-5", vec![template]);
    req.doctor_preferences
        .insert("Hypertension".to_string(), "HTN".to_string());

    let job_id = engine.submit(req).await.unwrap();
    let payloads = collect_payloads(&mut rx, 1).await;
    assert_eq!(wait_terminal(&registry, &job_id).await, JobStatus::Completed);

    // Content uses the preferred shorthand; the mapping still names the
    // canonical concept.
    assert!(payloads[0].section_content.contains("HTN"));
    assert!(!payloads[0].section_content.contains("Hypertension"));
    let mapping = payloads[0]
        .snomed_mappings
        .iter()
        .find(|m| m.concept_id == "38341003")
        .expect("canonical hypertension mapping attached");
    assert_eq!(mapping.preferred_term, "Hypertensive disorder");
}

#[tokio::test]
async fn french_transcript_resolves_french_concepts() {
    let transcript = "Docteur: Qu'est-ce qui vous amène aujourd'hui?\n\
Patient: J'ai une douleur thoracique depuis hier.";
    let terms = json!({
        "terms": [
            {
                "surface": "douleur thoracique",
                "normalized": "douleur thoracique",
                "occurrences": [{ "line_no": 2, "char_start": 0, "char_end": 5 }]
            }
        ]
    });
    let answer = json!({
        "noteContent": "Le patient rapporte une douleur thoracique depuis hier.",
        "lineReferences": [
            { "line": 2, "start": 18, "end": 36, "text": "douleur thoracique" }
        ],
        "medicalTerms": ["douleur thoracique"],
        "selfConfidence": 0.9
    });
    let template = TemplateRequest {
        template_id: "soap".to_string(),
        sections: vec![section("s", "subjective", &[])],
    };
    let llm = ScriptedLlm::new(terms).respond("PROMPT:s", vec![answer]);

    let (engine, mut rx, registry) = engine_with(Arc::new(llm));
    let mut req = request("conv-6", vec![template]);
    req.transcription_text = Some(transcript.to_string());
    req.language = Some("fr".to_string());

    let job_id = engine.submit(req).await.unwrap();
    let payloads = collect_payloads(&mut rx, 1).await;
    assert_eq!(wait_terminal(&registry, &job_id).await, JobStatus::Completed);

    let payload = &payloads[0];
    assert_eq!(payload.extracted_language, "fr");
    assert!(payload.section_content.contains("douleur thoracique"));

    let mapping = payload
        .snomed_mappings
        .iter()
        .find(|m| m.concept_id == "29857009")
        .expect("French concept mapping attached");
    assert_eq!(mapping.preferred_term, "Douleur thoracique");
    assert_eq!(mapping.language, "fr");

    // The reference resolves against the original French line.
    let (lines, _) = normalize(transcript, Some("fr"), 1 << 20).unwrap();
    let line = lines.iter().find(|l| l.line_no == 2).unwrap();
    let substring: String = line.text.chars().skip(18).take(18).collect();
    assert_eq!(substring, "douleur thoracique");
}

#[tokio::test]
async fn repair_prompt_recovers_a_failing_section() {
    let bad = json!({
        "noteContent": "Patient reports chest pain.",
        "lineReferences": [
            { "line": 2, "start": 0, "end": 10, "text": "chest pain" }
        ],
        "medicalTerms": ["chest pain"],
        "selfConfidence": 0.9
    });
    let template = TemplateRequest {
        template_id: "soap".to_string(),
        sections: vec![section("s", "subjective", &[])],
    };
    let llm = ScriptedLlm::new(english_terms())
        .respond("PROMPT:s", vec![bad, good_section("Patient reports chest pain.")]);
    let llm = Arc::new(llm);

    let (engine, mut rx, registry) = engine_with(llm.clone());
    let job_id = engine.submit(request("conv-7", vec![template])).await.unwrap();

    let payloads = collect_payloads(&mut rx, 1).await;
    assert_eq!(wait_terminal(&registry, &job_id).await, JobStatus::Completed);
    assert_eq!(payloads[0].validation_status, ValidationStatus::Accepted);
    assert_eq!(payloads[0].processing_metadata.attempts, 2);
    assert_eq!(llm.calls(), 2);
}

#[tokio::test]
async fn dependent_of_failed_section_errors_without_running() {
    let bad = json!({
        "noteContent": "Ungrounded claim.",
        "lineReferences": [
            { "line": 999, "start": 0, "end": 4, "text": "gone" }
        ],
        "medicalTerms": [],
        "selfConfidence": 0.9
    });
    let template = TemplateRequest {
        template_id: "soap".to_string(),
        sections: vec![
            section("s", "subjective", &[]),
            section("a", "assessment", &["s"]),
        ],
    };
    let llm = ScriptedLlm::new(english_terms())
        .respond("PROMPT:s", vec![bad])
        .respond("PROMPT:a", vec![good_section("Should never run.")]);
    let llm = Arc::new(llm);

    let (engine, mut rx, registry) = engine_with(llm.clone());
    let job_id = engine.submit(request("conv-8", vec![template])).await.unwrap();

    let payloads = collect_payloads(&mut rx, 2).await;
    assert_eq!(wait_terminal(&registry, &job_id).await, JobStatus::Failed);

    let s = &payloads[position(&payloads, "s")];
    assert_eq!(s.validation_status, ValidationStatus::FailedValidation);

    let a = &payloads[position(&payloads, "a")];
    assert_eq!(a.validation_status, ValidationStatus::Error);
    assert!(a.error.as_deref().unwrap().contains("dependency_failed"));

    // Only S consumed generation attempts; A never reached the model.
    assert_eq!(llm.calls(), 3);
}

#[tokio::test]
async fn turn_array_requests_are_accepted() {
    let template = TemplateRequest {
        template_id: "soap".to_string(),
        sections: vec![section("s", "subjective", &[])],
    };
    let answer = json!({
        "noteContent": "Patient reports chest pain.",
        "lineReferences": [
            { "line": 2, "start": 16, "end": 26, "text": "chest pain" }
        ],
        "medicalTerms": ["chest pain"],
        "selfConfidence": 0.9
    });
    let terms = json!({
        "terms": [
            {
                "surface": "chest pain",
                "normalized": "chest pain",
                "occurrences": [{ "line_no": 2, "char_start": 0, "char_end": 5 }]
            }
        ]
    });
    let llm = ScriptedLlm::new(terms).respond("PROMPT:s", vec![answer]);

    let (engine, mut rx, registry) = engine_with(Arc::new(llm));
    let mut turn = HashMap::new();
    turn.insert("doctor".to_string(), "What brings you in?".to_string());
    let mut turn2 = HashMap::new();
    turn2.insert("patient".to_string(), "I have chest pain.".to_string());

    let req = EncounterRequest {
        conversation_id: "conv-9".to_string(),
        templates: vec![template],
        transcription_text: None,
        transcript_turns: Some(vec![turn, turn2]),
        doctor_id: "dr-1".to_string(),
        doctor_preferences: HashMap::new(),
        language: Some("en".to_string()),
    };

    let job_id = engine.submit(req).await.unwrap();
    let payloads = collect_payloads(&mut rx, 1).await;
    assert_eq!(wait_terminal(&registry, &job_id).await, JobStatus::Completed);
    assert_eq!(payloads[0].validation_status, ValidationStatus::Accepted);
}

/// Deterministic embedder for exercising the semantic retrieval path:
/// vectors are simple character statistics, which is enough for cosine
/// ranking to be stable.
struct StaticEmbedder;

#[async_trait]
impl EmbeddingProvider for StaticEmbedder {
    fn model_name(&self) -> &str {
        "static-test"
    }

    fn dims(&self) -> usize {
        3
    }

    async fn embed(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                let letters = t.chars().filter(|c| c.is_alphabetic()).count() as f32;
                let digits = t.chars().filter(|c| c.is_numeric()).count() as f32;
                let spaces = t.chars().filter(|c| c.is_whitespace()).count() as f32;
                vec![letters, digits, spaces]
            })
            .collect())
    }
}

#[tokio::test]
async fn embedding_provider_drives_semantic_retrieval() {
    let template = TemplateRequest {
        template_id: "soap".to_string(),
        sections: vec![section("s", "subjective", &[])],
    };
    let llm = ScriptedLlm::new(english_terms())
        .respond("PROMPT:s", vec![good_section("Patient reports chest pain.")]);

    let (publisher, mut rx) = ChannelPublisher::new();
    let engine = Arc::new(Engine::new(
        Config::minimal(),
        Arc::new(MemoryVectorIndex::new()),
        Arc::new(StaticOntologyClient::with_default_concepts()),
        Arc::new(llm),
        Arc::new(StaticEmbedder),
        Arc::new(publisher),
        Arc::new(PreferenceStore::ephemeral()),
    ));
    let registry = engine.registry();

    let job_id = engine.submit(request("conv-12", vec![template])).await.unwrap();
    let payloads = collect_payloads(&mut rx, 1).await;
    assert_eq!(wait_terminal(&registry, &job_id).await, JobStatus::Completed);

    // The chunks were embedded at ingest and the query routed through
    // vector similarity, so retrieval returned context.
    assert_eq!(payloads[0].validation_status, ValidationStatus::Accepted);
    assert!(payloads[0].processing_metadata.chunks_retrieved >= 1);
}

#[tokio::test]
async fn empty_transcript_rejected_synchronously() {
    let llm = ScriptedLlm::new(english_terms());
    let (engine, _rx, _registry) = engine_with(Arc::new(llm));

    let mut req = request("conv-10", vec![soap_template()]);
    req.transcription_text = Some(String::new());
    let err = engine.submit(req).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTranscript(_)));
}

#[tokio::test]
async fn cyclic_templates_rejected_synchronously() {
    let llm = ScriptedLlm::new(english_terms());
    let (engine, _rx, _registry) = engine_with(Arc::new(llm));

    let cyclic = TemplateRequest {
        template_id: "cyclic".to_string(),
        sections: vec![section("x", "plan", &["y"]), section("y", "plan", &["x"])],
    };
    let err = engine.submit(request("conv-11", vec![cyclic])).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));
}
