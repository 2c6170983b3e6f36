use axum::{
    extract::{Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::stream::Stream;
use futures::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::database::ChatTurn;
use crate::models::{ChatRequest, MessagesQuery};
use crate::state::AppState;
use crate::utils::error::ApiError;

const DEFAULT_MESSAGE_LIMIT: i64 = 50;

/// POST /api/sessions/{id}/chat/stream
///
/// SSE framing: each chat event becomes one SSE event named after its type
/// with a JSON payload; the stream closes after the terminal `done` or
/// `error` event.
pub async fn chat_stream(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    info!(%session_id, chars = req.message.len(), "chat stream requested");

    let events = state
        .orchestrator
        .clone()
        .stream_chat(session_id, req.message)
        .await?;

    let sse = events.map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok(Event::default().event(event.event_name()).data(data))
    });

    Ok(Sse::new(sse).keep_alive(KeepAlive::default()))
}

/// GET /api/sessions/{id}/messages
pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<Vec<ChatTurn>>, ApiError> {
    if state.repository.get_session(session_id).await?.is_none() {
        return Err(ApiError::SessionNotFound(session_id));
    }

    let limit = query.limit.unwrap_or(DEFAULT_MESSAGE_LIMIT).clamp(1, 500);
    let turns = state.repository.recent_turns(session_id, limit).await?;
    Ok(Json(turns))
}
