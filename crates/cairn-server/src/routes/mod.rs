//! HTTP route handlers.

pub mod checkpoints;
pub mod events;

use crate::state::AppState;
use axum::{
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use cairn_core::CairnError;
use cairn_types::SessionId;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Body of every failed request.
#[derive(Debug, Serialize)]
pub struct ApiError {
    /// The operation that failed.
    pub operation: &'static str,
    pub error: String,
    /// Whether the working tree is known to be as it was before the request.
    pub unchanged: bool,
}

pub type ApiFailure = (StatusCode, Json<ApiError>);
pub type ApiResult<T> = Result<Json<T>, ApiFailure>;

pub(crate) fn failure(operation: &'static str, err: &CairnError) -> ApiFailure {
    let status = match err {
        CairnError::RestoreInProgress(_) => StatusCode::CONFLICT,
        CairnError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        CairnError::SnapshotNotFound(_) => StatusCode::NOT_FOUND,
        CairnError::InvalidSessionId(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(target: "cairn::api", "{} failed: {}", operation, err);
    }
    (
        status,
        Json(ApiError {
            operation,
            error: err.to_string(),
            unchanged: err.tree_unchanged(),
        }),
    )
}

pub(crate) fn bad_request(operation: &'static str, error: impl ToString) -> ApiFailure {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiError {
            operation,
            error: error.to_string(),
            unchanged: true,
        }),
    )
}

pub(crate) fn parse_session(operation: &'static str, raw: &str) -> Result<SessionId, ApiFailure> {
    SessionId::new(raw).map_err(|e| bad_request(operation, e))
}

/// Run blocking checkpoint work off the async runtime.
pub(crate) async fn blocking<T, F>(operation: &'static str, work: F) -> ApiResult<T>
where
    F: FnOnce() -> cairn_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(Ok(value)) => Ok(Json(value)),
        Ok(Err(e)) => Err(failure(operation, &e)),
        Err(join) => {
            warn!(target: "cairn::api", "{} aborted: {}", operation, join);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError {
                    operation,
                    error: join.to_string(),
                    unchanged: false,
                }),
            ))
        }
    }
}

/// The `/api` router.
pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/events", post(events::receive))
        .route("/sessions/{id}/timeline", get(checkpoints::timeline))
        .route(
            "/sessions/{id}/nodes/{node}/snapshot",
            get(checkpoints::has_snapshot),
        )
        .route("/sessions/{id}/jump", post(checkpoints::jump))
        .route("/sessions/{id}/undo", post(checkpoints::undo))
        .route("/sessions/{id}/redo", post(checkpoints::redo))
        .route("/sessions/{id}/fork", post(checkpoints::fork))
        .route("/sessions/{id}/checkpoints", delete(checkpoints::clear))
        .route("/sessions/{id}/position", get(checkpoints::position))
        .route("/health", get(health))
}
