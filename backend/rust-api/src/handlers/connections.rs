use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use std::sync::Arc;

use super::ApiError;
use crate::error::SyncError;
use crate::extractors::AppJson;
use crate::models::OpenConnectionRequest;
use crate::services::AppState;

/// POST /api/v1/attempts/{id}/connections
pub async fn open_connection(
    State(state): State<Arc<AppState>>,
    Path(attempt_id): Path<String>,
    AppJson(req): AppJson<OpenConnectionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let connection_id = req.connection_id.trim();
    if connection_id.is_empty() || connection_id.len() > 128 {
        return Err(SyncError::Validation("connection_id must be 1-128 characters".into()).into());
    }

    let seeded = state.sync.open_connection(&attempt_id, connection_id).await?;
    Ok((StatusCode::CREATED, Json(seeded)))
}

/// DELETE /api/v1/attempts/{id}/connections/{connection_id}
pub async fn close_connection(
    State(state): State<Arc<AppState>>,
    Path((attempt_id, connection_id)): Path<(String, String)>,
) -> impl IntoResponse {
    if state.sync.close_connection(&attempt_id, &connection_id) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}
