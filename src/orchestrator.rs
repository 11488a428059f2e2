//! Extraction orchestrator.
//!
//! Drives the full pipeline for one encounter job:
//!
//! 1. **Ingest** — normalize, chunk, upsert into the vector index. The
//!    index is fully populated before any section generation starts.
//! 2. **Global term resolution** — one deterministic extraction pass, then
//!    ontology resolution into job-scope concept mappings.
//! 3. **Section scheduling** — a DAG walk over `depends_on`: sections with
//!    satisfied dependencies run concurrently, bounded by the per-job and
//!    global semaphores, scheduled within a level in `order_index` order.
//! 4. **Per-section generation** — retrieve context, load preferences and
//!    dependency sections, generate, validate, publish. Bounded repair
//!    retries on validation failure.
//! 5. **Termination** — every section reaches a terminal state, then the
//!    job concludes as Completed, PartiallyFailed, or Failed. Cancellation
//!    wins over any later transition.
//!
//! Sections are published in completion order, at most once each;
//! dependents never start before their dependencies are accepted, so
//! publication order never inverts a dependency edge.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::chunk::{chunk_lines, render_line, ChunkPolicy};
use crate::config::Config;
use crate::context::SectionContextCache;
use crate::embedding::EmbeddingProvider;
use crate::error::{EngineError, EngineResult};
use crate::llm::{CallMode, LlmClient};
use crate::models::{
    ConceptMapping, JobStatus, LineRecord, LineReference, ProcessingMetadata, SectionPayload,
    SectionResult, SectionSpec, SectionState, TermCandidate, ValidationStatus,
};
use crate::ontology::OntologyClient;
use crate::preferences::PreferenceStore;
use crate::prompts;
use crate::publish::Publisher;
use crate::registry::JobRegistry;
use crate::templates::{resolve_templates, TemplateRequest};
use crate::terms::extract_terms;
use crate::transcript::{flatten_turns, normalize};
use crate::validate::{SectionValidator, ValidationInput};
use crate::vector::{QueryKey, VectorIndex};

/// One encounter processing request.
///
/// The transcript arrives either as a line-separated string or as a
/// speaker-turn array; exactly one of the two must be present.
#[derive(Debug, Clone, Deserialize)]
pub struct EncounterRequest {
    pub conversation_id: String,
    pub templates: Vec<TemplateRequest>,
    #[serde(default)]
    pub transcription_text: Option<String>,
    #[serde(default)]
    pub transcript_turns: Option<Vec<HashMap<String, String>>>,
    pub doctor_id: String,
    #[serde(default)]
    pub doctor_preferences: HashMap<String, String>,
    #[serde(default)]
    pub language: Option<String>,
}

/// The engine: every client and shared structure the pipeline needs,
/// injected at construction.
pub struct Engine {
    pub config: Config,
    vector: Arc<dyn VectorIndex>,
    ontology: Arc<dyn OntologyClient>,
    llm: Arc<dyn LlmClient>,
    embedder: Arc<dyn EmbeddingProvider>,
    publisher: Arc<dyn Publisher>,
    preferences: Arc<PreferenceStore>,
    registry: Arc<JobRegistry>,
    context: Arc<SectionContextCache>,
    global_slots: Arc<Semaphore>,
}

/// Per-job immutable context shared by every section task.
struct JobContext {
    job_id: String,
    conversation_id: String,
    template_group_id: String,
    language: String,
    lines: Arc<Vec<LineRecord>>,
    global_terms: Arc<Vec<TermCandidate>>,
    global_mappings: Arc<Vec<ConceptMapping>>,
    applied_preferences: Arc<Vec<(String, String)>>,
    cancel: CancellationToken,
}

/// What the model must return for one section.
#[derive(Debug, Deserialize)]
struct RawSectionOutput {
    #[serde(rename = "noteContent")]
    note_content: String,
    #[serde(rename = "lineReferences", default)]
    line_references: Vec<LineReference>,
    #[serde(rename = "medicalTerms", default)]
    medical_terms: Vec<String>,
    #[serde(rename = "selfConfidence", default = "default_self_confidence")]
    self_confidence: f64,
}

fn default_self_confidence() -> f64 {
    0.7
}

/// Outcome message a section task sends back to the scheduler.
struct SectionDone {
    section_id: String,
    state: SectionState,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        vector: Arc<dyn VectorIndex>,
        ontology: Arc<dyn OntologyClient>,
        llm: Arc<dyn LlmClient>,
        embedder: Arc<dyn EmbeddingProvider>,
        publisher: Arc<dyn Publisher>,
        preferences: Arc<PreferenceStore>,
    ) -> Self {
        let global_slots = Arc::new(Semaphore::new(config.orchestrator.global_concurrency));
        Self {
            config,
            vector,
            ontology,
            llm,
            embedder,
            publisher,
            preferences,
            registry: Arc::new(JobRegistry::new()),
            context: Arc::new(SectionContextCache::new()),
            global_slots,
        }
    }

    pub fn registry(&self) -> Arc<JobRegistry> {
        self.registry.clone()
    }

    pub fn preferences(&self) -> Arc<PreferenceStore> {
        self.preferences.clone()
    }

    /// Probe all mandatory backing services.
    pub async fn probe_dependencies(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("vector", self.vector.probe().await.is_ok()),
            ("ontology", self.ontology.probe().await.is_ok()),
            ("llm", self.llm.probe().await.is_ok()),
        ]
    }

    /// Validate and admit an encounter request. Malformed requests and
    /// invalid transcripts are rejected synchronously; otherwise the job
    /// runs in the background and its id is returned.
    pub async fn submit(self: &Arc<Self>, request: EncounterRequest) -> EngineResult<String> {
        if request.conversation_id.trim().is_empty() {
            return Err(EngineError::InvalidRequest(
                "conversation_id must not be empty".to_string(),
            ));
        }
        if request.doctor_id.trim().is_empty() {
            return Err(EngineError::InvalidRequest(
                "doctor_id must not be empty".to_string(),
            ));
        }
        if let Some(language) = &request.language {
            if language != "en" && language != "fr" {
                return Err(EngineError::InvalidRequest(format!(
                    "unsupported language '{}'",
                    language
                )));
            }
        }

        let specs = resolve_templates(&request.templates)?;

        let raw_text = match (&request.transcription_text, &request.transcript_turns) {
            (Some(text), _) if !text.is_empty() => text.clone(),
            (_, Some(turns)) if !turns.is_empty() => {
                let pairs: Vec<(String, String)> = turns
                    .iter()
                    .filter_map(|turn| {
                        turn.iter()
                            .next()
                            .map(|(speaker, text)| (speaker.clone(), text.clone()))
                    })
                    .collect();
                flatten_turns(&pairs)
            }
            _ => {
                return Err(EngineError::InvalidTranscript(
                    "transcript is empty".to_string(),
                ))
            }
        };

        let (lines, language) = normalize(
            &raw_text,
            request.language.as_deref(),
            self.config.limits.max_transcript_bytes,
        )?;

        let template_group_id = request
            .templates
            .iter()
            .map(|t| t.template_id.as_str())
            .collect::<Vec<_>>()
            .join("+");
        let section_ids: Vec<String> = specs.iter().map(|s| s.section_id.clone()).collect();

        let (job_id, cancel, superseded) =
            self.registry
                .start(&request.conversation_id, &template_group_id, &section_ids);
        if superseded.is_some() {
            info!(
                conversation_id = %request.conversation_id,
                "superseded a running job for the same template group"
            );
        }

        // Any earlier run of these templates (superseded or completed)
        // must not collide with this job's write-once cache entries.
        for template in &request.templates {
            self.context
                .drop_template(&request.conversation_id, &template.template_id);
        }

        // Preferences are snapshotted at job start; later updates do not
        // retroactively affect this job.
        let applied_preferences = Arc::new(self.preferences.snapshot(
            &request.doctor_id,
            &request.doctor_preferences,
            self.config.orchestrator.preference_threshold,
        ));

        let ctx = Arc::new(JobContext {
            job_id: job_id.clone(),
            conversation_id: request.conversation_id.clone(),
            template_group_id,
            language,
            lines: Arc::new(lines),
            global_terms: Arc::new(Vec::new()),
            global_mappings: Arc::new(Vec::new()),
            applied_preferences,
            cancel,
        });

        let engine = self.clone();
        let specs = Arc::new(specs);
        tokio::spawn(async move {
            engine.run_job(ctx, specs).await;
        });

        Ok(job_id)
    }

    async fn run_job(self: Arc<Self>, ctx: Arc<JobContext>, specs: Arc<Vec<SectionSpec>>) {
        let job_timeout = Duration::from_secs(self.config.orchestrator.job_timeout_secs);
        self.registry.mark_running(&ctx.job_id);
        info!(
            job_id = %ctx.job_id,
            conversation_id = %ctx.conversation_id,
            template_group = %ctx.template_group_id,
            sections = specs.len(),
            "job running"
        );

        let engine = self.clone();
        let run = {
            let ctx = ctx.clone();
            let specs = specs.clone();
            async move { engine.run_job_inner(ctx, specs).await }
        };

        let outcome = tokio::select! {
            res = tokio::time::timeout(job_timeout, run) => res,
            _ = ctx.cancel.cancelled() => {
                info!(job_id = %ctx.job_id, "job cancelled");
                // The registry already holds Cancelled (either via the
                // cancel endpoint or a superseding submit).
                self.registry.finish(&ctx.job_id, JobStatus::Cancelled);
                return;
            }
        };

        match outcome {
            Ok(()) => {
                let status = self.registry.conclude(&ctx.job_id);
                self.registry.finish(&ctx.job_id, status);
                info!(job_id = %ctx.job_id, ?status, "job finished");
            }
            Err(_elapsed) => {
                warn!(job_id = %ctx.job_id, "job timed out");
                ctx.cancel.cancel();
                for spec in specs.iter() {
                    self.registry
                        .set_section_state(&ctx.job_id, &spec.section_id, SectionState::Error);
                }
                self.registry.finish(&ctx.job_id, JobStatus::Failed);
            }
        }
    }

    async fn run_job_inner(self: Arc<Self>, ctx: Arc<JobContext>, specs: Arc<Vec<SectionSpec>>) {
        // Phase 1: ingest. Chunks must be visible to every retrieval
        // before any section starts. Embedding is best-effort: a chunk
        // without a vector is still indexed for text retrieval.
        let policy = ChunkPolicy::from(&self.config.chunking);
        let mut chunks = chunk_lines(&ctx.conversation_id, &ctx.lines, &policy);
        if self.embedder.is_enabled() {
            let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
            match self.embedder.embed(&texts).await {
                Ok(vectors) if vectors.len() == chunks.len() => {
                    for (chunk, vector) in chunks.iter_mut().zip(vectors) {
                        chunk.embedding = Some(vector);
                    }
                }
                Ok(vectors) => {
                    warn!(
                        job_id = %ctx.job_id,
                        expected = chunks.len(),
                        got = vectors.len(),
                        "embedding count mismatch, indexing without vectors"
                    );
                }
                Err(e) => {
                    warn!(
                        job_id = %ctx.job_id,
                        error = %e,
                        "chunk embedding failed, indexing without vectors"
                    );
                }
            }
        }
        if let Err(e) = self.vector.upsert(&ctx.conversation_id, &chunks).await {
            error!(job_id = %ctx.job_id, error = %e, "ingest failed");
            self.fail_all_sections(&ctx, &specs, &format!("ingest failed: {}", e))
                .await;
            return;
        }
        if ctx.cancel.is_cancelled() {
            return;
        }

        // Phase 2: global term resolution. An extraction failure fails the
        // job; an ontology outage degrades to unmapped terms.
        let stride = self
            .config
            .chunking
            .target_tokens
            .saturating_sub(self.config.chunking.overlap_tokens)
            .max(1);
        let global_terms = match extract_terms(
            self.llm.as_ref(),
            &ctx.lines,
            &ctx.language,
            self.config.llm.context_tokens,
            stride,
        )
        .await
        {
            Ok(terms) => terms,
            Err(e) => {
                error!(job_id = %ctx.job_id, error = %e, "term extraction failed");
                self.fail_all_sections(&ctx, &specs, &format!("term extraction failed: {}", e))
                    .await;
                return;
            }
        };

        let global_mappings = match self.ontology.resolve(&global_terms, &ctx.language).await {
            Ok(mappings) => mappings,
            Err(e) => {
                warn!(
                    job_id = %ctx.job_id,
                    error = %e,
                    "ontology unavailable, proceeding with unmapped terms"
                );
                Vec::new()
            }
        };
        info!(
            job_id = %ctx.job_id,
            terms = global_terms.len(),
            mappings = global_mappings.len(),
            "global term resolution complete"
        );

        let ctx = Arc::new(JobContext {
            job_id: ctx.job_id.clone(),
            conversation_id: ctx.conversation_id.clone(),
            template_group_id: ctx.template_group_id.clone(),
            language: ctx.language.clone(),
            lines: ctx.lines.clone(),
            global_terms: Arc::new(global_terms),
            global_mappings: Arc::new(global_mappings),
            applied_preferences: ctx.applied_preferences.clone(),
            cancel: ctx.cancel.clone(),
        });

        // Phase 3+4: schedule the section DAG.
        self.run_sections(ctx, specs).await;
    }

    /// Schedule sections as their dependencies are accepted, bounded by
    /// the per-job and global concurrency caps.
    async fn run_sections(self: &Arc<Self>, ctx: Arc<JobContext>, specs: Arc<Vec<SectionSpec>>) {
        let job_slots = Arc::new(Semaphore::new(self.config.orchestrator.section_concurrency));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<SectionDone>();

        let mut remaining: Vec<SectionSpec> = specs.as_ref().clone();
        remaining.sort_by_key(|s| s.order_index);
        let mut terminal: HashMap<String, SectionState> = HashMap::new();
        let mut scheduled: HashSet<String> = HashSet::new();
        let mut in_flight = 0usize;

        loop {
            // Propagate failures: a dependent of a failed section becomes
            // Error without running. Iterate to a fixpoint so chains fall
            // together.
            loop {
                let mut changed = false;
                for spec in &remaining {
                    if scheduled.contains(&spec.section_id)
                        || terminal.contains_key(&spec.section_id)
                    {
                        continue;
                    }
                    let failed_dep = spec.depends_on.iter().find(|dep| {
                        terminal
                            .get(*dep)
                            .map(|s| !dependency_satisfied(*s))
                            .unwrap_or(false)
                    });
                    if let Some(dep) = failed_dep {
                        warn!(
                            job_id = %ctx.job_id,
                            section = %spec.section_id,
                            dependency = %dep,
                            "section failed: dependency_failed"
                        );
                        self.registry.set_section_state(
                            &ctx.job_id,
                            &spec.section_id,
                            SectionState::Error,
                        );
                        self.publish_failure(
                            &ctx,
                            spec,
                            ValidationStatus::Error,
                            &format!("dependency_failed: {}", dep),
                        )
                        .await;
                        terminal.insert(spec.section_id.clone(), SectionState::Error);
                        changed = true;
                    }
                }
                if !changed {
                    break;
                }
            }

            // Schedule everything whose dependencies are satisfied, in
            // order_index order.
            if !ctx.cancel.is_cancelled() {
                for spec in &remaining {
                    if scheduled.contains(&spec.section_id)
                        || terminal.contains_key(&spec.section_id)
                    {
                        continue;
                    }
                    let ready = spec.depends_on.iter().all(|dep| {
                        terminal
                            .get(dep)
                            .map(|s| dependency_satisfied(*s))
                            .unwrap_or(false)
                    });
                    if !ready {
                        continue;
                    }

                    scheduled.insert(spec.section_id.clone());
                    in_flight += 1;

                    let engine = self.clone();
                    let ctx = ctx.clone();
                    let spec = spec.clone();
                    let job_slots = job_slots.clone();
                    let done_tx = done_tx.clone();
                    tokio::spawn(async move {
                        // Permits are acquired inside the task; the FIFO
                        // semaphore preserves the order_index submission
                        // order under contention.
                        let _job_permit = job_slots
                            .acquire_owned()
                            .await
                            .expect("job semaphore closed");
                        let _global_permit = engine
                            .global_slots
                            .clone()
                            .acquire_owned()
                            .await
                            .expect("global semaphore closed");
                        let state = engine.run_section(&ctx, &spec).await;
                        let _ = done_tx.send(SectionDone {
                            section_id: spec.section_id,
                            state,
                        });
                    });
                }
            }

            let pending_left = remaining
                .iter()
                .any(|s| !scheduled.contains(&s.section_id) && !terminal.contains_key(&s.section_id));
            if in_flight == 0 {
                if !pending_left || ctx.cancel.is_cancelled() {
                    break;
                }
            }

            tokio::select! {
                done = done_rx.recv() => {
                    match done {
                        Some(done) => {
                            terminal.insert(done.section_id, done.state);
                            in_flight -= 1;
                        }
                        None => break,
                    }
                }
                _ = ctx.cancel.cancelled() => {
                    // Stop scheduling; drain whatever is already running.
                    while in_flight > 0 {
                        if done_rx.recv().await.is_some() {
                            in_flight -= 1;
                        } else {
                            break;
                        }
                    }
                    break;
                }
            }
        }
    }

    /// The per-section pipeline: retrieve → generate → validate →
    /// publish, with bounded repair retries and a wall-clock budget.
    async fn run_section(
        self: &Arc<Self>,
        ctx: &Arc<JobContext>,
        spec: &SectionSpec,
    ) -> SectionState {
        if ctx.cancel.is_cancelled() {
            return SectionState::Pending;
        }

        let budget = Duration::from_secs(self.config.orchestrator.section_timeout_secs);
        let work = self.section_pipeline(ctx, spec);

        let result = tokio::select! {
            res = tokio::time::timeout(budget, work) => res,
            _ = ctx.cancel.cancelled() => {
                info!(job_id = %ctx.job_id, section = %spec.section_id, "section cancelled");
                return self
                    .registry
                    .section_state(&ctx.job_id, &spec.section_id)
                    .unwrap_or(SectionState::Pending);
            }
        };

        match result {
            Ok(state) => state,
            Err(_elapsed) => {
                warn!(job_id = %ctx.job_id, section = %spec.section_id, "section timed out");
                self.registry
                    .set_section_state(&ctx.job_id, &spec.section_id, SectionState::Error);
                self.publish_failure(ctx, spec, ValidationStatus::Error, "section timeout")
                    .await;
                SectionState::Error
            }
        }
    }

    async fn section_pipeline(&self, ctx: &Arc<JobContext>, spec: &SectionSpec) -> SectionState {
        let started = Instant::now();

        // (i) Retrieve top-k chunks by the section prompt and type
        // keywords, semantically when an embedding provider is
        // configured.
        self.registry
            .set_section_state(&ctx.job_id, &spec.section_id, SectionState::Retrieving);
        let query = format!(
            "{} {}",
            spec.prompt,
            spec.section_type.retrieval_keywords()
        );
        let embedded_query = if self.embedder.is_enabled() {
            match self.embedder.embed(std::slice::from_ref(&query)).await {
                Ok(mut vectors) if !vectors.is_empty() => Some(vectors.remove(0)),
                Ok(_) => None,
                Err(e) => {
                    warn!(
                        job_id = %ctx.job_id,
                        section = %spec.section_id,
                        error = %e,
                        "query embedding failed, falling back to text retrieval"
                    );
                    None
                }
            }
        } else {
            None
        };
        let key = match &embedded_query {
            Some(vector) => QueryKey::Embedding(vector),
            None => QueryKey::Text(&query),
        };
        let retrieved = match self
            .vector
            .query(&ctx.conversation_id, key, self.config.retrieval.k)
            .await
        {
            Ok(chunks) => chunks,
            Err(e) => {
                error!(job_id = %ctx.job_id, section = %spec.section_id, error = %e, "retrieval failed");
                self.registry
                    .set_section_state(&ctx.job_id, &spec.section_id, SectionState::Error);
                self.publish_failure(ctx, spec, ValidationStatus::Error, &e.to_string())
                    .await;
                return SectionState::Error;
            }
        };
        let chunks_retrieved = retrieved.len();

        // Fall back to the full numbered transcript when retrieval comes
        // back empty; a short encounter fits the prompt anyway.
        let transcript_context = if retrieved.is_empty() {
            ctx.lines
                .iter()
                .map(render_line)
                .collect::<Vec<_>>()
                .join("\n")
        } else {
            retrieved
                .iter()
                .map(|sc| sc.chunk.text.as_str())
                .collect::<Vec<_>>()
                .join("\n---\n")
        };

        // (iii) Dependency sections from the context cache.
        let dependencies = self.context.dependencies(
            &ctx.conversation_id,
            &spec.template_id,
            &spec.depends_on,
        );
        let previous = SectionContextCache::render_previous(&dependencies);

        let validator = SectionValidator::new(self.config.orchestrator.accept_threshold);
        let system = prompts::section_system(
            spec.section_type.label(),
            &ctx.language,
            &ctx.global_mappings,
            &ctx.applied_preferences,
            &previous,
        );
        let base_user = prompts::section_user(spec.section_type.label(), &spec.prompt, &transcript_context);

        let max_attempts = self.config.orchestrator.max_generation_attempts;
        let mut repair = String::new();
        let mut last_reasons: Vec<String> = Vec::new();

        for attempt in 1..=max_attempts {
            if ctx.cancel.is_cancelled() {
                return self
                    .registry
                    .section_state(&ctx.job_id, &spec.section_id)
                    .unwrap_or(SectionState::Pending);
            }

            // (iv) Compositional generation.
            self.registry
                .set_section_state(&ctx.job_id, &spec.section_id, SectionState::Generating);
            let user = format!("{}{}", base_user, repair);
            let response = match self
                .llm
                .complete_json(&system, &user, CallMode::Compositional)
                .await
            {
                Ok(value) => value,
                Err(e @ EngineError::LlmInvalidOutput(_)) => {
                    warn!(
                        job_id = %ctx.job_id,
                        section = %spec.section_id,
                        attempt,
                        error = %e,
                        "unparsable model output"
                    );
                    last_reasons = vec![e.to_string()];
                    self.registry.set_section_state(
                        &ctx.job_id,
                        &spec.section_id,
                        SectionState::Retrying,
                    );
                    continue;
                }
                Err(e) => {
                    // The LLM client already retried with backoff; a
                    // persistent dependency failure is terminal.
                    error!(job_id = %ctx.job_id, section = %spec.section_id, error = %e, "generation failed");
                    self.registry
                        .set_section_state(&ctx.job_id, &spec.section_id, SectionState::Error);
                    self.publish_failure(ctx, spec, ValidationStatus::Error, &e.to_string())
                        .await;
                    return SectionState::Error;
                }
            };

            let raw: RawSectionOutput = match serde_json::from_value(response) {
                Ok(raw) => raw,
                Err(e) => {
                    last_reasons = vec![format!("schema-violating output: {}", e)];
                    self.registry.set_section_state(
                        &ctx.job_id,
                        &spec.section_id,
                        SectionState::Retrying,
                    );
                    continue;
                }
            };

            // (v) Validate: the semantic consistency judge caps the
            // model's self score, then grounding, structure, and
            // confidence are checked.
            self.registry
                .set_section_state(&ctx.job_id, &spec.section_id, SectionState::Validating);
            let self_confidence = match self
                .consistency_score(&raw.note_content, &transcript_context)
                .await
            {
                Some(judge) => raw.self_confidence.min(judge),
                None => raw.self_confidence,
            };
            let outcome = validator.validate(&ValidationInput {
                lines: &ctx.lines,
                spec,
                content: &raw.note_content,
                references: &raw.line_references,
                self_confidence,
                claimed_terms: &raw.medical_terms,
                global_terms: &ctx.global_terms,
                global_mappings: &ctx.global_mappings,
            });

            if outcome.accepted {
                let result = SectionResult {
                    section_id: spec.section_id.clone(),
                    content: raw.note_content,
                    line_references: raw.line_references,
                    snomed_mappings: outcome.section_mappings,
                    confidence: outcome.confidence,
                    language: ctx.language.clone(),
                    validation_status: ValidationStatus::Accepted,
                };

                // (vi) Cache first so dependents observe the content only
                // after acceptance, then publish exactly once.
                if let Err(e) = self.context.insert(
                    &ctx.conversation_id,
                    &spec.template_id,
                    result.clone(),
                ) {
                    error!(job_id = %ctx.job_id, section = %spec.section_id, error = %e, "cache write failed");
                    self.registry
                        .set_section_state(&ctx.job_id, &spec.section_id, SectionState::Error);
                    return SectionState::Error;
                }
                self.registry
                    .set_section_state(&ctx.job_id, &spec.section_id, SectionState::Accepted);

                let payload = SectionPayload {
                    template_type: spec.template_id.clone(),
                    section_type: spec.section_type.label().to_string(),
                    section_id: spec.section_id.clone(),
                    section_content: result.content.clone(),
                    line_references: result.line_references.clone(),
                    snomed_mappings: result.snomed_mappings.clone(),
                    confidence_score: result.confidence,
                    extracted_language: result.language.clone(),
                    processing_metadata: ProcessingMetadata {
                        duration_ms: started.elapsed().as_millis() as u64,
                        attempts: attempt,
                        chunks_retrieved,
                        model: self.llm.model_name().to_string(),
                    },
                    validation_status: ValidationStatus::Accepted,
                    error: None,
                };
                if let Err(e) = self.publisher.publish(&payload).await {
                    error!(job_id = %ctx.job_id, section = %spec.section_id, error = %e, "delivery failed");
                    self.registry.set_section_state(
                        &ctx.job_id,
                        &spec.section_id,
                        SectionState::DeliveryFailed,
                    );
                    return SectionState::DeliveryFailed;
                }
                info!(
                    job_id = %ctx.job_id,
                    section = %spec.section_id,
                    attempt,
                    confidence = result.confidence,
                    "section accepted"
                );
                return SectionState::Accepted;
            }

            last_reasons = outcome.reasons.clone();
            if attempt < max_attempts {
                self.registry
                    .set_section_state(&ctx.job_id, &spec.section_id, SectionState::Retrying);
                repair = if outcome.citation.failures.is_empty() {
                    format!(
                        "\n\nYour previous answer was rejected: {}. Try again.",
                        outcome.reasons.join("; ")
                    )
                } else {
                    prompts::repair_addendum(&outcome.citation.failures)
                };
            }
        }

        warn!(
            job_id = %ctx.job_id,
            section = %spec.section_id,
            reasons = ?last_reasons,
            "section failed validation after {} attempts",
            max_attempts
        );
        self.registry.set_section_state(
            &ctx.job_id,
            &spec.section_id,
            SectionState::FailedValidation,
        );
        self.publish_failure(
            ctx,
            spec,
            ValidationStatus::FailedValidation,
            &last_reasons.join("; "),
        )
        .await;
        SectionState::FailedValidation
    }

    /// Deterministic fact-check of generated content against the source
    /// chunks it was drawn from, normalized from the judge's 1-10 scale
    /// into `[0, 1]`. A judge outage or unparsable verdict never fails a
    /// section; the self score stands alone in that case.
    async fn consistency_score(&self, content: &str, source_chunks: &str) -> Option<f64> {
        if content.trim().is_empty() {
            return None;
        }
        match self
            .llm
            .complete_json(
                prompts::CONSISTENCY_JUDGE_SYSTEM,
                &prompts::consistency_judge_user(content, source_chunks),
                CallMode::Deterministic,
            )
            .await
        {
            Ok(verdict) => {
                let score = verdict.get("factualConsistencyScore")?.as_f64()?;
                Some((score / 10.0).clamp(0.0, 1.0))
            }
            Err(e) => {
                warn!(error = %e, "consistency judge unavailable");
                None
            }
        }
    }

    /// Publish a failure payload for a definitively-failed section.
    async fn publish_failure(
        &self,
        ctx: &Arc<JobContext>,
        spec: &SectionSpec,
        status: ValidationStatus,
        reason: &str,
    ) {
        let payload = SectionPayload {
            template_type: spec.template_id.clone(),
            section_type: spec.section_type.label().to_string(),
            section_id: spec.section_id.clone(),
            section_content: String::new(),
            line_references: Vec::new(),
            snomed_mappings: Vec::new(),
            confidence_score: 0.0,
            extracted_language: ctx.language.clone(),
            processing_metadata: ProcessingMetadata {
                model: self.llm.model_name().to_string(),
                ..ProcessingMetadata::default()
            },
            validation_status: status,
            error: Some(reason.to_string()),
        };
        if let Err(e) = self.publisher.publish(&payload).await {
            warn!(section = %spec.section_id, error = %e, "failure payload delivery failed");
        }
    }

    /// Mark every section of the job failed and publish the reason.
    async fn fail_all_sections(
        &self,
        ctx: &Arc<JobContext>,
        specs: &[SectionSpec],
        reason: &str,
    ) {
        for spec in specs {
            self.registry
                .set_section_state(&ctx.job_id, &spec.section_id, SectionState::Error);
            self.publish_failure(ctx, spec, ValidationStatus::Error, reason)
                .await;
        }
    }
}

/// A dependency is satisfied once its content is available to dependents:
/// Accepted, or accepted-but-undeliverable (the content is in the cache).
fn dependency_satisfied(state: SectionState) -> bool {
    matches!(
        state,
        SectionState::Accepted | SectionState::DeliveryFailed
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_satisfaction() {
        assert!(dependency_satisfied(SectionState::Accepted));
        assert!(dependency_satisfied(SectionState::DeliveryFailed));
        assert!(!dependency_satisfied(SectionState::FailedValidation));
        assert!(!dependency_satisfied(SectionState::Error));
    }

    #[test]
    fn raw_section_output_parses_model_shape() {
        let json = serde_json::json!({
            "noteContent": "Patient reports chest pain.",
            "lineReferences": [
                { "line": 2, "start": 16, "end": 26, "text": "chest pain" }
            ],
            "medicalTerms": ["chest pain"],
            "selfConfidence": 0.9
        });
        let raw: RawSectionOutput = serde_json::from_value(json).unwrap();
        assert_eq!(raw.line_references.len(), 1);
        assert_eq!(raw.line_references[0].line, 2);
        assert!((raw.self_confidence - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn missing_optional_fields_default() {
        let json = serde_json::json!({ "noteContent": "text" });
        let raw: RawSectionOutput = serde_json::from_value(json).unwrap();
        assert!(raw.line_references.is_empty());
        assert!(raw.medical_terms.is_empty());
        assert!((raw.self_confidence - 0.7).abs() < f64::EPSILON);
    }
}
