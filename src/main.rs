//! # notegen CLI
//!
//! The `notegen` binary drives the extraction engine.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `notegen serve` | Start the HTTP gateway |
//! | `notegen process <request.json>` | Run one encounter end-to-end, streaming sections as JSON lines |
//! | `notegen validate-templates <templates.json>` | Structural template validation |
//!
//! All commands accept `--config <path>` pointing at a TOML configuration
//! file; without one, built-in defaults are used (in-memory vector index,
//! static ontology, embeddings disabled).
//!
//! ## Examples
//!
//! ```bash
//! notegen serve --config ./config/notegen.toml --probe
//! notegen process ./encounter.json
//! notegen validate-templates ./templates.json
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use notegen::config::{load_config, Config};
use notegen::embedding::build_provider;
use notegen::llm::OpenAiCompatClient;
use notegen::models::JobStatus;
use notegen::ontology::{CachedOntology, GraphOntologyClient, OntologyClient, StaticOntologyClient};
use notegen::orchestrator::{EncounterRequest, Engine};
use notegen::preferences::PreferenceStore;
use notegen::publish::{ChannelPublisher, HttpCallbackPublisher, Publisher};
use notegen::server::run_server;
use notegen::templates::{resolve_templates, TemplateRequest};
use notegen::vector::{HttpVectorIndex, MemoryVectorIndex, VectorIndex};

/// Grounded clinical-note extraction engine.
#[derive(Parser)]
#[command(
    name = "notegen",
    about = "Grounded clinical-note extraction engine",
    version
)]
struct Cli {
    /// Path to configuration file (TOML). Defaults apply when absent.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway.
    Serve {
        /// Probe the vector index, ontology, and LLM at boot; refuse to
        /// start when a mandatory service is unreachable.
        #[arg(long)]
        probe: bool,
    },

    /// Process one encounter request from a JSON file, printing each
    /// section payload as a JSON line the moment it completes.
    Process {
        /// Path to the request JSON (same shape as `POST /encounters`).
        request: PathBuf,
    },

    /// Validate template structure without starting a job.
    ValidateTemplates {
        /// Path to a JSON file: `{ "templates": [...] }` or a bare array.
        templates: PathBuf,
    },
}

fn load_or_default(path: &Option<PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(p) => load_config(p),
        None => Ok(Config::minimal()),
    }
}

fn build_engine(config: Config, publisher: Arc<dyn Publisher>) -> anyhow::Result<Arc<Engine>> {
    let vector: Arc<dyn VectorIndex> = match config.vector.backend.as_str() {
        "http" => Arc::new(HttpVectorIndex::new(&config.vector)?),
        _ => Arc::new(MemoryVectorIndex::new()),
    };
    let ontology: Arc<dyn OntologyClient> = match config.ontology.backend.as_str() {
        // Concept lookups over the wire are cached; the static table is
        // already in memory.
        "graph" => Arc::new(CachedOntology::new(GraphOntologyClient::new(
            &config.ontology,
        )?)),
        _ => Arc::new(StaticOntologyClient::with_default_concepts()),
    };
    let llm = Arc::new(OpenAiCompatClient::new(&config.llm)?);
    let embedder = build_provider(&config.embedding)?;
    let preferences = Arc::new(PreferenceStore::load(&config.preferences.path)?);

    Ok(Arc::new(Engine::new(
        config,
        vector,
        ontology,
        llm,
        embedder,
        publisher,
        preferences,
    )))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_or_default(&cli.config)?;

    match cli.command {
        Commands::Serve { probe } => {
            let bind = config.server.bind.clone();
            let engine = if let Some(url) = &config.publisher.callback_url {
                tracing::info!(callback = %url, "delivering sections via HTTP callback");
                build_engine(
                    config.clone(),
                    Arc::new(HttpCallbackPublisher::new(&config.publisher)?),
                )?
            } else {
                // Without a callback the stream is drained to stdout so
                // completed sections are still observable.
                let (publisher, mut rx) = ChannelPublisher::new();
                tokio::spawn(async move {
                    while let Some(payload) = rx.recv().await {
                        match serde_json::to_string(&payload) {
                            Ok(line) => println!("{}", line),
                            Err(e) => tracing::warn!(error = %e, "unserializable payload"),
                        }
                    }
                });
                build_engine(config, Arc::new(publisher))?
            };

            if probe {
                let failing: Vec<&str> = engine
                    .probe_dependencies()
                    .await
                    .into_iter()
                    .filter(|(_, ok)| !ok)
                    .map(|(name, _)| name)
                    .collect();
                if !failing.is_empty() {
                    anyhow::bail!("mandatory services unreachable: {}", failing.join(", "));
                }
            }

            run_server(engine, &bind).await?;
        }

        Commands::Process { request } => {
            let raw = std::fs::read_to_string(&request)
                .with_context(|| format!("Failed to read request file: {}", request.display()))?;
            let request: EncounterRequest =
                serde_json::from_str(&raw).context("Failed to parse request JSON")?;

            let (publisher, mut rx) = ChannelPublisher::new();
            let engine = build_engine(config, Arc::new(publisher))?;
            let job_id = engine.submit(request).await?;
            eprintln!("job {}", job_id);

            let registry = engine.registry();
            let mut poll = tokio::time::interval(Duration::from_millis(200));
            let final_status: JobStatus = loop {
                tokio::select! {
                    payload = rx.recv() => {
                        if let Some(payload) = payload {
                            println!("{}", serde_json::to_string(&payload)?);
                        }
                    }
                    _ = poll.tick() => {
                        if let Some(snapshot) = registry.snapshot(&job_id) {
                            if snapshot.status.is_terminal() {
                                // Drain anything still buffered.
                                while let Ok(payload) = rx.try_recv() {
                                    println!("{}", serde_json::to_string(&payload)?);
                                }
                                break snapshot.status;
                            }
                        }
                    }
                }
            };
            eprintln!("job finished: {:?}", final_status);
        }

        Commands::ValidateTemplates { templates } => {
            let raw = std::fs::read_to_string(&templates)
                .with_context(|| format!("Failed to read templates file: {}", templates.display()))?;
            let parsed: Vec<TemplateRequest> = match serde_json::from_str::<
                HashMap<String, Vec<TemplateRequest>>,
            >(&raw)
            {
                Ok(mut wrapper) => wrapper.remove("templates").unwrap_or_default(),
                Err(_) => serde_json::from_str(&raw).context("Failed to parse templates JSON")?,
            };
            let specs = resolve_templates(&parsed)?;
            println!("valid: {} sections across {} templates", specs.len(), parsed.len());
        }
    }

    Ok(())
}
