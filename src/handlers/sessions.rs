use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::database::Session;
use crate::models::{CreateSessionRequest, SessionMode, UpdateSessionRequest};
use crate::state::AppState;
use crate::utils::error::ApiError;

/// POST /api/sessions
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<Session>), ApiError> {
    let title = req.title.trim();
    if title.is_empty() {
        return Err(ApiError::Validation("title cannot be empty".into()));
    }

    let session = state
        .repository
        .create_session(title, req.mode.unwrap_or_default())
        .await?;
    info!(session_id = %session.id, "session created");
    Ok((StatusCode::CREATED, Json(session)))
}

/// GET /api/sessions
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Session>>, ApiError> {
    Ok(Json(state.repository.list_sessions().await?))
}

/// GET /api/sessions/{id}
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Session>, ApiError> {
    let session = state
        .repository
        .get_session(id)
        .await?
        .ok_or(ApiError::SessionNotFound(id))?;
    Ok(Json(session))
}

/// PUT /api/sessions/{id}
pub async fn update_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateSessionRequest>,
) -> Result<Json<Session>, ApiError> {
    let session = state
        .repository
        .update_session(id, req.title.as_deref(), req.mode)
        .await?
        .ok_or(ApiError::SessionNotFound(id))?;
    Ok(Json(session))
}

/// PUT /api/sessions/{id}/mode
pub async fn set_session_mode(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(mode): Json<SessionMode>,
) -> Result<Json<Session>, ApiError> {
    let session = state
        .repository
        .update_session(id, None, Some(mode))
        .await?
        .ok_or(ApiError::SessionNotFound(id))?;
    info!(session_id = %id, mode = mode.as_str(), "session mode changed");
    Ok(Json(session))
}

/// DELETE /api/sessions/{id}
pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.document_service.delete_session(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
