//! HTTP gateway.
//!
//! Exposes the engine's inbound interface over a JSON API for the
//! orchestrating gateway.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/encounters` | Submit an encounter for processing |
//! | `POST` | `/jobs/{job_id}/cancel` | Cancel a job (idempotent) |
//! | `GET`  | `/jobs/{job_id}` | Job status snapshot |
//! | `POST` | `/templates/validate` | Structural template validation |
//! | `GET`  | `/preferences/{doctor_id}` | Stored doctor preferences |
//! | `PUT`  | `/preferences/{doctor_id}` | Replace doctor preferences |
//! | `GET`  | `/health` | Probe vector, ontology, and LLM clients |
//!
//! # Error contract
//!
//! ```json
//! { "error": { "code": "invalid_request", "message": "..." } }
//! ```
//!
//! Section outputs are not served here; they are delivered through the
//! configured publication sink as each section completes.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::error::EngineError;
use crate::models::{JobSnapshot, PreferenceEntry};
use crate::orchestrator::{EncounterRequest, Engine};
use crate::templates::{resolve_templates, TemplateRequest};

/// Shared state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
}

/// Start the gateway server. Runs until the process is terminated.
pub async fn run_server(engine: Arc<Engine>, bind: &str) -> anyhow::Result<()> {
    let state = AppState { engine };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/encounters", post(handle_process_encounter))
        .route("/jobs/:job_id/cancel", post(handle_cancel_job))
        .route("/jobs/:job_id", get(handle_job_status))
        .route("/templates/validate", post(handle_validate_templates))
        .route(
            "/preferences/:doctor_id",
            get(handle_get_preferences).put(handle_put_preferences),
        )
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    info!(bind, "extraction engine listening");
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        let status = match &e {
            EngineError::InvalidRequest(_) | EngineError::InvalidTranscript(_) => {
                StatusCode::BAD_REQUEST
            }
            EngineError::DependencyUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError {
            status,
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

// ============ POST /encounters ============

#[derive(Serialize)]
struct AcknowledgementResponse {
    job_id: String,
    status: String,
    message: String,
    conversation_id: String,
}

async fn handle_process_encounter(
    State(state): State<AppState>,
    Json(request): Json<EncounterRequest>,
) -> Result<(StatusCode, Json<AcknowledgementResponse>), AppError> {
    let conversation_id = request.conversation_id.clone();
    let job_id = state.engine.submit(request).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(AcknowledgementResponse {
            job_id,
            status: "accepted".to_string(),
            message: "sections will be delivered via the publication sink".to_string(),
            conversation_id,
        }),
    ))
}

// ============ POST /jobs/{job_id}/cancel ============

#[derive(Serialize)]
struct CancelResponse {
    job_id: String,
    snapshot: JobSnapshot,
}

async fn handle_cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<CancelResponse>, AppError> {
    let registry = state.engine.registry();
    if !registry.cancel(&job_id) {
        return Err(not_found(format!("unknown job '{}'", job_id)));
    }
    let snapshot = registry
        .snapshot(&job_id)
        .ok_or_else(|| not_found(format!("unknown job '{}'", job_id)))?;
    Ok(Json(CancelResponse { job_id, snapshot }))
}

// ============ GET /jobs/{job_id} ============

async fn handle_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobSnapshot>, AppError> {
    state
        .engine
        .registry()
        .snapshot(&job_id)
        .map(Json)
        .ok_or_else(|| not_found(format!("unknown job '{}'", job_id)))
}

// ============ POST /templates/validate ============

#[derive(Deserialize)]
struct ValidateTemplatesRequest {
    templates: Vec<TemplateRequest>,
}

#[derive(Serialize)]
struct ValidateTemplatesResponse {
    valid: bool,
    sections: usize,
}

async fn handle_validate_templates(
    Json(request): Json<ValidateTemplatesRequest>,
) -> Result<Json<ValidateTemplatesResponse>, AppError> {
    let specs = resolve_templates(&request.templates)?;
    Ok(Json(ValidateTemplatesResponse {
        valid: true,
        sections: specs.len(),
    }))
}

// ============ Preferences ============

async fn handle_get_preferences(
    State(state): State<AppState>,
    Path(doctor_id): Path<String>,
) -> Json<HashMap<String, PreferenceEntry>> {
    Json(state.engine.preferences().get(&doctor_id))
}

#[derive(Serialize)]
struct PutPreferencesResponse {
    doctor_id: String,
    stored: usize,
}

async fn handle_put_preferences(
    State(state): State<AppState>,
    Path(doctor_id): Path<String>,
    Json(preferences): Json<HashMap<String, String>>,
) -> Result<Json<PutPreferencesResponse>, AppError> {
    let stored = preferences.len();
    state.engine.preferences().put(&doctor_id, preferences)?;
    Ok(Json(PutPreferencesResponse { doctor_id, stored }))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    services: HashMap<String, bool>,
}

async fn handle_health(State(state): State<AppState>) -> Response {
    let probes = state.engine.probe_dependencies().await;
    let healthy = probes.iter().all(|(_, ok)| *ok);
    let services: HashMap<String, bool> = probes
        .into_iter()
        .map(|(name, ok)| (name.to_string(), ok))
        .collect();

    let body = Json(HealthResponse {
        status: if healthy { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        services,
    });
    if healthy {
        (StatusCode::OK, body).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, body).into_response()
    }
}
