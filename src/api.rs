//! HTTP surface for the document pipeline.
//!
//! This module exposes a compact Axum router over the orchestrator's public operations:
//!
//! - `GET /stages` – Registered stage names in pipeline order.
//! - `POST /pipeline` – Upload a source file and run the full pipeline (duplicates go smart).
//! - `GET /documents/:id/status` – Derived status of every stage.
//! - `POST /documents/:id/stages` – Run a list of stages (`stages`, `stop_on_error`).
//! - `POST /documents/:id/stages/:stage` – Run one stage.
//! - `POST /documents/:id/stages/:stage/flag` – Fail a stage through a quality gate.
//! - `POST /documents/:id/smart` – Run only pending and failed stages.
//! - `POST /batch` – Process many documents on the bounded worker pool.
//! - `POST /search` – Similarity search by query text or raw vector.
//! - `GET /metrics` – Pipeline counters and the in-flight gauge.
//! - `GET /commands` – Machine-readable command catalog for discovery.
//!
//! Handlers carry no pipeline logic of their own.

use crate::metrics::MetricsSnapshot;
use crate::pipeline::{
    BatchItem, BatchItemResult, BatchOptions, BatchStageResult, Orchestrator, PipelineError,
    PipelineResult, Stage, StageResult, StageStatus, UploadInput,
};
use crate::stages::EmbeddingProcessor;
use crate::store::{DocumentId, ScoredChunk, SearchFilters, StoreError};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_TOP_K: usize = 10;
const MAX_TOP_K: usize = 100;

/// Services the handlers call into.
#[derive(Clone)]
pub struct AppState {
    /// Pipeline entry point.
    pub orchestrator: Arc<Orchestrator>,
    /// Similarity search over chunk embeddings.
    pub search: Arc<EmbeddingProcessor>,
    /// Worker pool size used when a batch request does not set one.
    pub max_concurrency: usize,
}

/// Build the HTTP router exposing the pipeline API surface.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/stages", get(list_stages))
        .route("/pipeline", post(run_full_pipeline))
        .route("/documents/:id/status", get(document_status))
        .route("/documents/:id/stages", post(run_stages))
        .route("/documents/:id/stages/:stage", post(run_single_stage))
        .route("/documents/:id/stages/:stage/flag", post(flag_stage))
        .route("/documents/:id/smart", post(run_smart))
        .route("/batch", post(run_batch))
        .route("/search", post(search))
        .route("/metrics", get(get_metrics))
        .route("/commands", get(get_commands))
        .with_state(state)
}

#[derive(Serialize)]
struct StagesResponse {
    stages: Vec<&'static str>,
}

async fn list_stages(State(state): State<AppState>) -> Json<StagesResponse> {
    Json(StagesResponse {
        stages: state.orchestrator.available_stages(),
    })
}

/// Upload a file and run every registered stage.
async fn run_full_pipeline(
    State(state): State<AppState>,
    Json(input): Json<UploadInput>,
) -> Result<Json<PipelineResult>, AppError> {
    let result = state.orchestrator.process_full_pipeline(input).await?;
    tracing::info!(
        document_id = %result.document_id,
        duplicate = result.duplicate,
        success = result.success,
        "Pipeline request completed"
    );
    Ok(Json(result))
}

#[derive(Serialize)]
struct StatusResponse {
    document_id: DocumentId,
    active: bool,
    statuses: BTreeMap<Stage, StageStatus>,
}

async fn document_status(
    State(state): State<AppState>,
    Path(document_id): Path<DocumentId>,
) -> Result<Json<StatusResponse>, AppError> {
    let statuses = state.orchestrator.stage_statuses(document_id).await?;
    Ok(Json(StatusResponse {
        document_id,
        active: state.orchestrator.is_active(document_id),
        statuses,
    }))
}

/// Request body for `POST /documents/:id/stages`.
#[derive(Deserialize)]
struct RunStagesRequest {
    /// Stage names, executed in the given order.
    stages: Vec<String>,
    /// Abort after the first failed stage.
    #[serde(default)]
    stop_on_error: bool,
}

async fn run_stages(
    State(state): State<AppState>,
    Path(document_id): Path<DocumentId>,
    Json(request): Json<RunStagesRequest>,
) -> Result<Json<BatchStageResult>, AppError> {
    let result = state
        .orchestrator
        .run_stages(document_id, &request.stages, request.stop_on_error)
        .await?;
    Ok(Json(result))
}

async fn run_single_stage(
    State(state): State<AppState>,
    Path((document_id, stage)): Path<(DocumentId, String)>,
) -> Result<Json<StageResult>, AppError> {
    let result = state
        .orchestrator
        .run_single_stage(document_id, &stage)
        .await?;
    Ok(Json(result))
}

/// Request body for `POST /documents/:id/stages/:stage/flag`.
#[derive(Deserialize)]
struct FlagRequest {
    /// Why the stage output was rejected.
    reason: String,
}

async fn flag_stage(
    State(state): State<AppState>,
    Path((document_id, stage)): Path<(DocumentId, String)>,
    Json(request): Json<FlagRequest>,
) -> Result<StatusCode, AppError> {
    state
        .orchestrator
        .flag_stage_failed(document_id, &stage, &request.reason)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn run_smart(
    State(state): State<AppState>,
    Path(document_id): Path<DocumentId>,
) -> Result<Json<PipelineResult>, AppError> {
    Ok(Json(state.orchestrator.process_smart(document_id).await?))
}

/// Request body for `POST /batch`.
#[derive(Deserialize)]
struct BatchRequest {
    items: Vec<BatchItem>,
    #[serde(default)]
    max_concurrency: Option<usize>,
    /// Overall deadline in milliseconds.
    #[serde(default)]
    deadline_ms: Option<u64>,
}

#[derive(Serialize)]
struct BatchResponse {
    results: Vec<BatchItemResult>,
}

async fn run_batch(
    State(state): State<AppState>,
    Json(request): Json<BatchRequest>,
) -> Result<Json<BatchResponse>, AppError> {
    let max_concurrency = request.max_concurrency.unwrap_or(state.max_concurrency);
    if max_concurrency == 0 {
        return Err(PipelineError::Validation("max_concurrency must be positive".into()).into());
    }
    let options = BatchOptions {
        max_concurrency,
        deadline: request.deadline_ms.map(Duration::from_millis),
    };
    let results = state
        .orchestrator
        .process_batch(request.items, options)
        .await;
    Ok(Json(BatchResponse { results }))
}

/// Request body for `POST /search`; exactly one of `query` or `vector`.
#[derive(Deserialize)]
struct SearchRequest {
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    vector: Option<Vec<f32>>,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    filters: SearchFilters,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<ScoredChunk>,
}

async fn search(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    let top_k = request.top_k.unwrap_or(DEFAULT_TOP_K).min(MAX_TOP_K);
    let results = match (request.query, request.vector) {
        (Some(query), None) => {
            state
                .search
                .search_text(&query, top_k, &request.filters)
                .await?
        }
        (None, Some(vector)) => {
            state
                .search
                .search_similar(&vector, top_k, &request.filters)
                .await?
        }
        _ => {
            return Err(PipelineError::Validation(
                "provide exactly one of `query` or `vector`".into(),
            )
            .into());
        }
    };
    Ok(Json(SearchResponse { results }))
}

async fn get_metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.orchestrator.metrics().snapshot())
}

/// Descriptor for a single command in the discovery catalog.
#[derive(Serialize)]
struct CommandDescriptor {
    name: &'static str,
    method: &'static str,
    path: &'static str,
    description: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_example: Option<serde_json::Value>,
}

/// Response body for `GET /commands`.
#[derive(Serialize)]
struct CommandsResponse {
    commands: Vec<CommandDescriptor>,
}

/// Enumerate supported HTTP commands for discovery in dashboards and tools.
async fn get_commands() -> Json<CommandsResponse> {
    Json(CommandsResponse {
        commands: vec![
            CommandDescriptor {
                name: "list_stages",
                method: "GET",
                path: "/stages",
                description: "Registered stage names in pipeline order.",
                request_example: None,
            },
            CommandDescriptor {
                name: "process",
                method: "POST",
                path: "/pipeline",
                description: "Upload a manual and run the full pipeline; a duplicate upload only runs missing stages.",
                request_example: Some(json!({
                    "path": "/manuals/service-manual.txt",
                    "metadata": { "manufacturer": "Kyocera" }
                })),
            },
            CommandDescriptor {
                name: "status",
                method: "GET",
                path: "/documents/:id/status",
                description: "Derived status (pending, processing, completed, failed) of every stage.",
                request_example: None,
            },
            CommandDescriptor {
                name: "run_stages",
                method: "POST",
                path: "/documents/:id/stages",
                description: "Run the listed stages in order.",
                request_example: Some(json!({
                    "stages": ["text_extraction", "classification", "embedding"],
                    "stop_on_error": true
                })),
            },
            CommandDescriptor {
                name: "run_stage",
                method: "POST",
                path: "/documents/:id/stages/:stage",
                description: "Run a single stage.",
                request_example: None,
            },
            CommandDescriptor {
                name: "flag_stage",
                method: "POST",
                path: "/documents/:id/stages/:stage/flag",
                description: "Mark a completed stage as failed so the next smart run redoes it.",
                request_example: Some(json!({ "reason": "tables garbled" })),
            },
            CommandDescriptor {
                name: "smart",
                method: "POST",
                path: "/documents/:id/smart",
                description: "Run only the pending and failed stages.",
                request_example: None,
            },
            CommandDescriptor {
                name: "batch",
                method: "POST",
                path: "/batch",
                description: "Process many documents with bounded concurrency; one result per item.",
                request_example: Some(json!({
                    "items": [
                        { "type": "upload", "path": "/manuals/a.txt" },
                        { "type": "document", "document_id": "00000000-0000-0000-0000-000000000000" }
                    ],
                    "max_concurrency": 4,
                    "deadline_ms": 600000
                })),
            },
            CommandDescriptor {
                name: "search",
                method: "POST",
                path: "/search",
                description: "Cosine similarity search over chunk embeddings.",
                request_example: Some(json!({
                    "query": "fuser error E045",
                    "top_k": 5,
                    "filters": { "manufacturer": "Kyocera" }
                })),
            },
            CommandDescriptor {
                name: "metrics",
                method: "GET",
                path: "/metrics",
                description: "Pipeline counters useful for observability dashboards.",
                request_example: None,
            },
        ],
    })
}

struct AppError(PipelineError);

impl AppError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            PipelineError::Configuration(_) => StatusCode::BAD_REQUEST,
            PipelineError::DocumentBusy(_) => StatusCode::CONFLICT,
            PipelineError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            PipelineError::Store(StoreError::NotFound { .. }) => StatusCode::NOT_FOUND,
            PipelineError::Store(StoreError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::UpstreamService(_) => StatusCode::BAD_GATEWAY,
            PipelineError::Store(_) | PipelineError::PartialFailure { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        (
            status,
            Json(json!({ "error": self.0.to_string(), "kind": self.0.kind() })),
        )
            .into_response()
    }
}

impl From<PipelineError> for AppError {
    fn from(inner: PipelineError) -> Self {
        Self(inner)
    }
}
