use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use crate::errors::QueueError;
use crate::pipeline::PipelinePayload;
use crate::queue::JobQueue;
use crate::sandbox::{SandboxJobManager, SandboxJobSpec, SandboxTransaction, TransactionStep};
use crate::workspace::check_project_id;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub queue: JobQueue,
    pub sandbox: Arc<SandboxJobManager>,
    pub transactions: SandboxTransaction,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePipelineRequest {
    pub project_id: Option<String>,
    pub prompt: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRequest {
    pub project_id: Option<String>,
    #[serde(default)]
    pub steps: Vec<TransactionStep>,
    pub image: Option<String>,
}

#[derive(Deserialize)]
pub struct PipelineStatusQuery {
    pub id: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        match err {
            not_found @ QueueError::JobNotFound { .. } => ApiError::NotFound(not_found.to_string()),
            QueueError::InvalidPayload(msg) => ApiError::BadRequest(msg),
            other => {
                error!(error = %other, "queue request failed");
                ApiError::Internal(other.to_string())
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health))
        .route("/api/pipeline", get(pipeline_status).post(create_pipeline))
        .route("/api/sandbox/jobs", get(list_jobs).post(start_job))
        .route("/api/sandbox/jobs/{id}", get(get_job).delete(stop_job))
        .route("/api/sandbox/jobs/{id}/logs", get(job_logs))
        .route("/api/sandbox/transaction", post(run_transaction))
}

async fn health() -> &'static str {
    "ok"
}

// ── Pipeline handlers ─────────────────────────────────────────────────

async fn create_pipeline(
    State(state): State<SharedState>,
    Json(req): Json<CreatePipelineRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (Some(project_id), Some(prompt)) = (req.project_id, req.prompt) else {
        return Err(ApiError::BadRequest("projectId and prompt are required".into()));
    };
    let payload = PipelinePayload::new(project_id, prompt);
    payload.validate().map_err(ApiError::BadRequest)?;

    let id = state.queue.enqueue(payload).await?;
    Ok(Json(json!({"id": id.to_string()})))
}

async fn pipeline_status(
    State(state): State<SharedState>,
    Query(query): Query<PipelineStatusQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let raw = query
        .id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("id is required".into()))?;
    let id: i64 = raw
        .trim()
        .parse()
        .map_err(|_| ApiError::NotFound(format!("Queue job {} not found", raw)))?;

    let status = state.queue.status(id).await?;
    Ok(Json(status))
}

// ── Sandbox handlers ──────────────────────────────────────────────────

async fn list_jobs(State(state): State<SharedState>) -> impl IntoResponse {
    Json(json!({"jobs": state.sandbox.list()}))
}

async fn start_job(
    State(state): State<SharedState>,
    Json(spec): Json<SandboxJobSpec>,
) -> impl IntoResponse {
    let job = state.sandbox.start(spec);
    Json(json!({"job": job}))
}

async fn get_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .sandbox
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("Sandbox job {} not found", id)))?;
    Ok(Json(json!({"job": job})))
}

async fn job_logs(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .sandbox
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("Sandbox job {} not found", id)))?;
    Ok(Json(json!({"logs": job.logs, "status": job.status})))
}

async fn stop_job(State(state): State<SharedState>, Path(id): Path<String>) -> impl IntoResponse {
    Json(json!({"ok": state.sandbox.stop(&id)}))
}

async fn run_transaction(
    State(state): State<SharedState>,
    Json(req): Json<TransactionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let project_id = req.project_id.unwrap_or_default();
    if project_id.trim().is_empty() || req.steps.is_empty() {
        return Err(ApiError::BadRequest("projectId and steps are required".into()));
    }
    check_project_id(&project_id).map_err(ApiError::BadRequest)?;

    let outcome = state
        .transactions
        .run(state.sandbox.as_ref(), &project_id, &req.steps, req.image.as_deref())
        .await
        .map_err(|e| {
            error!(project_id = %project_id, error = %e, "sandbox transaction failed");
            ApiError::Internal(format!("{:#}", e))
        })?;
    Ok(Json(outcome))
}

// ── Tests ─────────────────────────────────────────────────────────────
