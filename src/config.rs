use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub ontology: OntologyConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub preferences: PreferencesConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_target_tokens")]
    pub target_tokens: usize,
    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: usize,
    #[serde(default = "default_true")]
    pub respect_speaker_boundaries: bool,
    #[serde(default = "default_min_lines")]
    pub min_lines: usize,
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_tokens: default_target_tokens(),
            overlap_tokens: default_overlap_tokens(),
            respect_speaker_boundaries: true,
            min_lines: default_min_lines(),
            max_lines: default_max_lines(),
        }
    }
}

fn default_target_tokens() -> usize {
    1500
}
fn default_overlap_tokens() -> usize {
    150
}
fn default_true() -> bool {
    true
}
fn default_min_lines() -> usize {
    1
}
fn default_max_lines() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Number of chunks fetched per section query.
    #[serde(default = "default_k")]
    pub k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self { k: default_k() }
    }
}

fn default_k() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"disabled"` or `"openai"`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_embed_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_embed_retries")]
    pub max_retries: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            endpoint: None,
            model: None,
            dims: None,
            timeout_secs: default_embed_timeout(),
            max_retries: default_embed_retries(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_embed_timeout() -> u64 {
    30
}
fn default_embed_retries() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorConfig {
    /// `"memory"` for the in-process index, `"http"` for a remote store.
    #[serde(default = "default_memory")]
    pub backend: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_index_name")]
    pub index: String,
    #[serde(default = "default_vector_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            backend: default_memory(),
            endpoint: None,
            index: default_index_name(),
            timeout_secs: default_vector_timeout(),
            username: None,
            password: None,
        }
    }
}

fn default_memory() -> String {
    "memory".to_string()
}
fn default_index_name() -> String {
    "encounters".to_string()
}
fn default_vector_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct OntologyConfig {
    /// `"static"` for the bundled concept table, `"graph"` for a remote
    /// concept graph.
    #[serde(default = "default_static")]
    pub backend: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Best concepts returned per input term.
    #[serde(default = "default_n_max")]
    pub n_max: usize,
    #[serde(default = "default_ontology_timeout")]
    pub timeout_secs: u64,
}

impl Default for OntologyConfig {
    fn default() -> Self {
        Self {
            backend: default_static(),
            endpoint: None,
            database: default_database(),
            username: None,
            password: None,
            n_max: default_n_max(),
            timeout_secs: default_ontology_timeout(),
        }
    }
}

fn default_static() -> String {
    "static".to_string()
}
fn default_database() -> String {
    "neo4j".to_string()
}
fn default_n_max() -> usize {
    5
}
fn default_ontology_timeout() -> u64 {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    /// Per-call timeout.
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_llm_attempts")]
    pub max_attempts: u32,
    /// Backoff cap between attempts.
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_secs: u64,
    /// Temperature for compositional (section generation) calls.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Approximate prompt budget for the term extractor; transcripts past
    /// it are windowed.
    #[serde(default = "default_context_tokens")]
    pub context_tokens: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            model: default_model(),
            timeout_secs: default_llm_timeout(),
            max_attempts: default_llm_attempts(),
            backoff_cap_secs: default_backoff_cap(),
            temperature: default_temperature(),
            context_tokens: default_context_tokens(),
        }
    }
}

fn default_model() -> String {
    "gpt-4o".to_string()
}
fn default_llm_timeout() -> u64 {
    20
}
fn default_llm_attempts() -> u32 {
    3
}
fn default_backoff_cap() -> u64 {
    30
}
fn default_temperature() -> f32 {
    0.2
}
fn default_context_tokens() -> usize {
    24_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct OrchestratorConfig {
    /// In-flight sections per job.
    #[serde(default = "default_section_concurrency")]
    pub section_concurrency: usize,
    /// In-flight sections across all jobs.
    #[serde(default = "default_global_concurrency")]
    pub global_concurrency: usize,
    /// Generation attempts per section before `failed_validation`.
    #[serde(default = "default_generation_attempts")]
    pub max_generation_attempts: u32,
    /// Wall-clock budget per section.
    #[serde(default = "default_section_timeout")]
    pub section_timeout_secs: u64,
    /// Wall-clock budget per job.
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,
    /// Minimum blended confidence for a section to be accepted.
    #[serde(default = "default_accept_threshold")]
    pub accept_threshold: f64,
    /// Minimum stored confidence for a doctor preference to be applied.
    #[serde(default = "default_preference_threshold")]
    pub preference_threshold: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            section_concurrency: default_section_concurrency(),
            global_concurrency: default_global_concurrency(),
            max_generation_attempts: default_generation_attempts(),
            section_timeout_secs: default_section_timeout(),
            job_timeout_secs: default_job_timeout(),
            accept_threshold: default_accept_threshold(),
            preference_threshold: default_preference_threshold(),
        }
    }
}

fn default_section_concurrency() -> usize {
    4
}
fn default_global_concurrency() -> usize {
    16
}
fn default_generation_attempts() -> u32 {
    3
}
fn default_section_timeout() -> u64 {
    30
}
fn default_job_timeout() -> u64 {
    1200
}
fn default_accept_threshold() -> f64 {
    0.6
}
fn default_preference_threshold() -> f64 {
    0.7
}

#[derive(Debug, Deserialize, Clone)]
pub struct PreferencesConfig {
    #[serde(default = "default_preferences_path")]
    pub path: PathBuf,
}

impl Default for PreferencesConfig {
    fn default() -> Self {
        Self {
            path: default_preferences_path(),
        }
    }
}

fn default_preferences_path() -> PathBuf {
    PathBuf::from("./data/doctor_preferences.json")
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PublisherConfig {
    /// Callback URL for section delivery. When absent, sections are
    /// delivered over the in-process channel sink.
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default = "default_publish_retries")]
    pub max_retries: u32,
    #[serde(default = "default_publish_timeout")]
    pub timeout_secs: u64,
}

fn default_publish_retries() -> u32 {
    3
}
fn default_publish_timeout() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    /// Maximum transcript size in bytes; larger inputs are rejected.
    #[serde(default = "default_max_transcript_bytes")]
    pub max_transcript_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_transcript_bytes: default_max_transcript_bytes(),
        }
    }
}

fn default_max_transcript_bytes() -> usize {
    4 * 1024 * 1024
}

impl Config {
    /// A default configuration usable without a config file: in-memory
    /// vector index, static ontology, embeddings disabled.
    pub fn minimal() -> Self {
        toml::from_str("").expect("empty config deserializes via defaults")
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.server.bind.trim().is_empty() {
        anyhow::bail!("server.bind must not be empty");
    }

    if config.chunking.target_tokens == 0 {
        anyhow::bail!("chunking.target_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.target_tokens {
        anyhow::bail!("chunking.overlap_tokens must be < chunking.target_tokens");
    }
    if config.chunking.max_lines < config.chunking.min_lines {
        anyhow::bail!("chunking.max_lines must be >= chunking.min_lines");
    }

    if config.retrieval.k == 0 {
        anyhow::bail!("retrieval.k must be >= 1");
    }

    if config.orchestrator.section_concurrency == 0 {
        anyhow::bail!("orchestrator.section_concurrency must be >= 1");
    }
    if config.orchestrator.global_concurrency < config.orchestrator.section_concurrency {
        anyhow::bail!("orchestrator.global_concurrency must be >= section_concurrency");
    }
    if config.orchestrator.max_generation_attempts == 0 {
        anyhow::bail!("orchestrator.max_generation_attempts must be >= 1");
    }
    for (name, value) in [
        ("orchestrator.accept_threshold", config.orchestrator.accept_threshold),
        (
            "orchestrator.preference_threshold",
            config.orchestrator.preference_threshold,
        ),
    ] {
        if !(0.0..=1.0).contains(&value) {
            anyhow::bail!("{} must be in [0.0, 1.0]", name);
        }
    }

    match config.vector.backend.as_str() {
        "memory" => {}
        "http" => {
            if config.vector.endpoint.is_none() {
                anyhow::bail!("vector.endpoint required when vector.backend is 'http'");
            }
        }
        other => anyhow::bail!("Unknown vector backend: '{}'. Must be memory or http.", other),
    }

    match config.ontology.backend.as_str() {
        "static" => {}
        "graph" => {
            if config.ontology.endpoint.is_none() {
                anyhow::bail!("ontology.endpoint required when ontology.backend is 'graph'");
            }
        }
        other => anyhow::bail!(
            "Unknown ontology backend: '{}'. Must be static or graph.",
            other
        ),
    }

    match config.embedding.provider.as_str() {
        "disabled" => {}
        "openai" => {
            if config.embedding.model.is_none() {
                anyhow::bail!("embedding.model required when provider is 'openai'");
            }
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                anyhow::bail!("embedding.dims must be > 0 when provider is 'openai'");
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    if config.limits.max_transcript_bytes == 0 {
        anyhow::bail!("limits.max_transcript_bytes must be > 0");
    }

    Ok(())
}
