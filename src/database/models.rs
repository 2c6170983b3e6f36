use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

/// Mode and status columns are stored as TEXT; typed accessors live on the
/// enums in `models::domain` and conversion happens at the service edge.
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: Uuid,
    pub title: String,
    pub current_mode: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: Uuid,
    pub session_id: Uuid,
    pub file_name: String,
    pub mime_type: String,
    pub file_size: i64,
    pub status: String,
    pub chunk_count: i32,
    pub summary: Option<String>,
    pub topics: Option<Json<Vec<String>>>,
    pub processing_error: Option<String>,
    pub uploaded_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentImage {
    pub id: Uuid,
    pub document_id: Uuid,
    pub session_id: Uuid,
    pub image_index: i32,
    pub mime_type: String,
    pub alt_text: String,
    pub file_path: String,
    pub width: i32,
    pub height: i32,
    pub page_number: Option<i32>,
    pub x_pdf: Option<f32>,
    pub y_pdf: Option<f32>,
    pub spatial_group_id: Option<i32>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTurn {
    pub id: Uuid,
    pub session_id: Uuid,
    pub role: String,
    pub content: String,
    pub mode_used: String,
    pub token_count: i32,
    pub is_compacted: bool,
    /// Ordered document ids cited by this (assistant) turn.
    pub retrieved_context_json: Option<Json<Vec<Uuid>>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub id: Uuid,
    pub session_id: Uuid,
    pub summary_content: String,
    pub message_count: i32,
    pub token_count: i32,
    pub original_token_count: i32,
    pub from_timestamp: DateTime<Utc>,
    pub to_timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Summary {
    /// 1 - token_count/original_token_count, never negative.
    pub fn compression_ratio(&self) -> f32 {
        if self.original_token_count == 0 {
            return 0.0;
        }
        (1.0 - self.token_count as f32 / self.original_token_count as f32).max(0.0)
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    pub content: String,
    pub kind: String,
    pub importance: f32,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}
