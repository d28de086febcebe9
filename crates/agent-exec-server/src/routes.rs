//! `/workspace` route handlers.
//!
//! Lifecycle failures map onto status codes (traversal 400, missing 404,
//! collision 409, external failure 500) with a `{"detail": ...}` body. The
//! code-action route is different by contract: fragment failures never fault
//! the HTTP call, they come back encoded in the execution result.
//!
//! Clones, archives, and fragment execution all block, so every handler hops
//! onto the blocking pool.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::info;

use agent_exec::{run_code, ExecutionResult, RunSettings, WorkspaceError, WorkspaceManager};

use crate::models::{
    CreateWorkspaceRequest, RestoreRequest, RunCodeRequest, SnapshotRequest, SnapshotResponse,
    WorkspaceResponse,
};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<WorkspaceManager>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/workspace/create", post(handle_create))
        .route("/workspace/snapshot", post(handle_snapshot))
        .route("/workspace/restore", post(handle_restore))
        .route("/workspace/run_code", post(handle_run_code))
        .route("/workspace/health", get(handle_health))
        .route("/workspace/{workspace_ref}", delete(handle_delete))
        .with_state(state)
}

pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn internal(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: detail.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

impl From<WorkspaceError> for ApiError {
    fn from(err: WorkspaceError) -> Self {
        let status = match &err {
            WorkspaceError::Traversal { .. } => StatusCode::BAD_REQUEST,
            WorkspaceError::WorkspaceNotFound { .. } | WorkspaceError::SnapshotNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            WorkspaceError::Exists { .. } => StatusCode::CONFLICT,
            WorkspaceError::CloneFailed { .. }
            | WorkspaceError::ArchiveFailed { .. }
            | WorkspaceError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError {
            status,
            detail: err.to_string(),
        }
    }
}

/// Run a blocking closure on the blocking pool, folding a lost worker into a
/// 500 rather than a panic.
async fn blocking<T, F>(f: F) -> Result<Result<T, WorkspaceError>, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, WorkspaceError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::internal(format!("worker task failed: {e}")))
}

async fn handle_create(
    State(state): State<AppState>,
    Json(req): Json<CreateWorkspaceRequest>,
) -> Result<Json<WorkspaceResponse>, ApiError> {
    let manager = Arc::clone(&state.manager);
    let reference = req.workspace_ref.clone();
    let message = format!("Cloned {} @ {}", req.repo_url, req.git_ref);

    blocking(move || manager.create(&req.workspace_ref, &req.repo_url, &req.git_ref)).await??;

    Ok(Json(WorkspaceResponse {
        workspace_ref: reference,
        success: true,
        message,
    }))
}

async fn handle_snapshot(
    State(state): State<AppState>,
    Json(req): Json<SnapshotRequest>,
) -> Result<Json<SnapshotResponse>, ApiError> {
    let manager = Arc::clone(&state.manager);
    let reference = req.workspace_ref.clone();

    let (snapshot_key, size_bytes) =
        blocking(move || manager.snapshot(&req.workspace_ref)).await??;

    Ok(Json(SnapshotResponse {
        workspace_ref: reference,
        snapshot_key,
        size_bytes,
    }))
}

async fn handle_restore(
    State(state): State<AppState>,
    Json(req): Json<RestoreRequest>,
) -> Result<Json<WorkspaceResponse>, ApiError> {
    let manager = Arc::clone(&state.manager);
    let reference = req.workspace_ref.clone();
    let message = format!("Restored from snapshot '{}'", req.snapshot_key);

    blocking(move || manager.restore(&req.workspace_ref, &req.snapshot_key)).await??;

    Ok(Json(WorkspaceResponse {
        workspace_ref: reference,
        success: true,
        message,
    }))
}

async fn handle_delete(
    State(state): State<AppState>,
    Path(workspace_ref): Path<String>,
) -> Result<Json<WorkspaceResponse>, ApiError> {
    let manager = Arc::clone(&state.manager);
    let reference = workspace_ref.clone();

    blocking(move || manager.delete(&workspace_ref)).await??;

    Ok(Json(WorkspaceResponse {
        workspace_ref: reference,
        success: true,
        message: "Workspace deleted.".to_string(),
    }))
}

/// Execute a code action. The workspace directory is created on demand as a
/// convenience for local testing; in production the orchestrator always
/// calls `/create` first.
///
/// This route never faults the HTTP call: a workspace ref that cannot be
/// resolved (traversal, I/O failure) comes back encoded in the execution
/// result like any other failure, so the agent can read it and correct
/// itself on the next turn.
async fn handle_run_code(
    State(state): State<AppState>,
    Json(req): Json<RunCodeRequest>,
) -> Result<Json<ExecutionResult>, ApiError> {
    let manager = Arc::clone(&state.manager);
    let settings = RunSettings {
        timeout: Duration::from_secs(req.timeout_sec),
        ..RunSettings::default()
    };

    info!(workspace = %req.workspace_ref, timeout_sec = req.timeout_sec, "code action received");

    let result = tokio::task::spawn_blocking(move || {
        match manager.ensure_workspace_dir(&req.workspace_ref) {
            Ok(workspace_dir) => run_code(&req.code, &workspace_dir, settings),
            Err(e) => ExecutionResult {
                exit_code: 1,
                stdout: String::new(),
                stderr: format!("workspace '{}' is unavailable: {e}", req.workspace_ref),
                elapsed_sec: 0.0,
                error_type: None,
            },
        }
    })
    .await
    .map_err(|e| ApiError::internal(format!("worker task failed: {e}")))?;

    Ok(Json(result))
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
