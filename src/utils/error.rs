use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("Document not found: {0}")]
    DocumentNotFound(Uuid),

    #[error("Unsupported document type: {0}")]
    UnsupportedDocument(String),

    #[error("Document too large: {size} bytes (max {max})")]
    DocumentTooLarge { size: usize, max: usize },

    #[error("Document processing failed: {0}")]
    DocumentProcessing(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Search failed: {0}")]
    SearchError(String),

    #[error("Index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("Memory extraction failed: {0}")]
    MemoryExtraction(String),

    #[error("Memory retrieval failed: {0}")]
    MemoryRetrieval(String),

    #[error("LLM request failed: {0}")]
    LlmError(String),

    #[error("LLM stream failed: {0}")]
    LlmStreamError(String),

    #[error("Embedding request failed: {0}")]
    EmbeddingError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl ApiError {
    /// Stable machine-readable code for the REST envelope.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::SessionNotFound(_) => "SESSION_001",
            ApiError::DocumentNotFound(_) => "DOCUMENT_001",
            ApiError::UnsupportedDocument(_) => "DOCUMENT_002",
            ApiError::DocumentTooLarge { .. } => "DOCUMENT_003",
            ApiError::DocumentProcessing(_) => "DOCUMENT_002",
            ApiError::Validation(_) => "VALIDATION_001",
            ApiError::SearchError(_) => "SEARCH_001",
            ApiError::IndexUnavailable(_) => "SEARCH_002",
            ApiError::MemoryExtraction(_) => "MEMORY_001",
            ApiError::MemoryRetrieval(_) => "MEMORY_002",
            ApiError::LlmError(_) => "LLM_001",
            ApiError::LlmStreamError(_) => "LLM_002",
            ApiError::EmbeddingError(_) => "LLM_003",
            ApiError::DatabaseError(_) => "INTERNAL_001",
            ApiError::InternalError(_) => "INTERNAL_001",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::SessionNotFound(_) | ApiError::DocumentNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::UnsupportedDocument(_) | ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::DocumentTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::DocumentProcessing(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::LlmError(_) | ApiError::LlmStreamError(_) | ApiError::EmbeddingError(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// REST error envelope. `path` is filled in by the envelope middleware so
/// handlers do not have to thread the request URI through their errors.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub error_id: Uuid,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    pub path: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(code, %message, "request failed");
        } else {
            tracing::warn!(code, %message, "request rejected");
        }

        let body = ErrorEnvelope {
            error_id: Uuid::new_v4(),
            code: code.to_string(),
            message,
            details: None,
            timestamp: Utc::now(),
            path: String::new(),
        };

        let mut response = (status, Json(body)).into_response();
        response
            .headers_mut()
            .insert("x-error-envelope", axum::http::HeaderValue::from_static("1"));
        response
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        ApiError::DatabaseError(e.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::InternalError(e.to_string())
    }
}
