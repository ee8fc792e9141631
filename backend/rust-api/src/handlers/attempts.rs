use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use super::ApiError;
use crate::error::{SyncError, SyncErrorKind};
use crate::extractors::AppJson;
use crate::models::{AutoSaveRequest, SyncResult, SynchronizeRequest};
use crate::services::AppState;

const MAX_CHANGES_PER_REQUEST: usize = 1000;

fn check_change_count(len: usize) -> Result<(), ApiError> {
    if len > MAX_CHANGES_PER_REQUEST {
        return Err(SyncError::Validation(format!(
            "at most {} changes per request, got {}",
            MAX_CHANGES_PER_REQUEST, len
        ))
        .into());
    }
    Ok(())
}

fn result_status(result: &SyncResult) -> StatusCode {
    if result.queued {
        return StatusCode::ACCEPTED;
    }
    match result.error.as_ref().map(|e| e.kind) {
        None => StatusCode::OK,
        Some(SyncErrorKind::NotFound) => StatusCode::NOT_FOUND,
        Some(SyncErrorKind::Validation) => StatusCode::BAD_REQUEST,
        Some(SyncErrorKind::VersionConflict)
        | Some(SyncErrorKind::AttemptClosed)
        | Some(SyncErrorKind::UnresolvedConflict) => StatusCode::CONFLICT,
        Some(SyncErrorKind::Transient) | Some(SyncErrorKind::CircuitOpen) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// The result body is returned on failure too: it carries the version to
/// resume from.
fn sync_response<T: Serialize>(result: &SyncResult, body: T) -> Response {
    let mut response = (result_status(result), Json(body)).into_response();
    let retry_after = result
        .error
        .as_ref()
        .and_then(|e| e.retry_after_ms)
        .map(|ms| ms.div_ceil(1000).max(1));
    if let Some(secs) = retry_after {
        if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    response
}

#[derive(Serialize)]
struct SynchronizeResponse<'a> {
    synchronized: bool,
    #[serde(flatten)]
    result: &'a SyncResult,
}

/// GET /api/v1/attempts/{id}/state
pub async fn get_state(
    State(state): State<Arc<AppState>>,
    Path(attempt_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let attempt = state.sync.get_state(&attempt_id).await?;
    Ok(Json(attempt))
}

/// POST /api/v1/attempts/{id}/autosave
pub async fn auto_save(
    State(state): State<Arc<AppState>>,
    Path(attempt_id): Path<String>,
    AppJson(req): AppJson<AutoSaveRequest>,
) -> Result<Response, ApiError> {
    check_change_count(req.changes.len())?;
    tracing::info!(
        "Auto-save for attempt {}: {} changes (connection {:?})",
        attempt_id,
        req.changes.len(),
        req.connection_id
    );

    let result = state.sync.auto_save(&attempt_id, req).await;
    Ok(sync_response(&result, &result))
}

/// POST /api/v1/attempts/{id}/sync
pub async fn synchronize(
    State(state): State<Arc<AppState>>,
    Path(attempt_id): Path<String>,
    AppJson(req): AppJson<SynchronizeRequest>,
) -> Result<Response, ApiError> {
    check_change_count(req.changes.len())?;
    tracing::info!(
        "Synchronize attempt {} from client v{} with {} changes",
        attempt_id,
        req.local_version,
        req.changes.len()
    );

    let result = state.sync.synchronize(&attempt_id, req).await;
    let body = SynchronizeResponse {
        synchronized: result.success,
        result: &result,
    };
    Ok(sync_response(&result, body))
}

/// POST /api/v1/attempts/{id}/force-sync
pub async fn force_sync(
    State(state): State<Arc<AppState>>,
    Path(attempt_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    tracing::info!("Force sync requested for attempt {}", attempt_id);
    let attempt = state.sync.force_sync(&attempt_id).await?;
    Ok(Json(attempt))
}

/// POST /api/v1/attempts/{id}/submit
pub async fn submit(
    State(state): State<Arc<AppState>>,
    Path(attempt_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let score = state.sync.submit(&attempt_id).await?;
    Ok(Json(score))
}

/// GET /api/v1/attempts/{id}/stats
pub async fn attempt_stats(
    State(state): State<Arc<AppState>>,
    Path(attempt_id): Path<String>,
) -> impl IntoResponse {
    Json(state.sync.attempt_stats(&attempt_id).await)
}

/// GET /api/v1/sync/stats
pub async fn sync_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.sync.stats())
}
