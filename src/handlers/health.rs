use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use std::sync::Arc;

use crate::models::api::{HealthResponse, HealthStatsResponse};
use crate::state::AppState;

/// GET /health
pub async fn health_check() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
    )
}

/// GET /health/stats
pub async fn health_stats(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<HealthStatsResponse>) {
    let sessions = state.repository.count_sessions().await.unwrap_or(-1);
    let documents = state.repository.count_documents().await.unwrap_or(-1);
    let degraded = sessions < 0 || documents < 0;

    (
        if degraded {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::OK
        },
        Json(HealthStatsResponse {
            status: if degraded { "degraded" } else { "healthy" }.to_string(),
            sessions,
            documents,
            processing_slots_free: state.processing_pool.available(),
            timestamp: Utc::now(),
        }),
    )
}
