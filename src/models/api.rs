use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::domain::SessionMode;

// ===== REQUEST MODELS =====

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub title: String,
    #[serde(default)]
    pub mode: Option<SessionMode>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateSessionRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub mode: Option<SessionMode>,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    #[serde(default)]
    pub limit: Option<i64>,
}

// ===== STREAM EVENT MODELS =====

/// One event on the chat stream. Framing on the wire is SSE with the variant
/// name as the event type and the payload as JSON data. Ordering per call:
/// zero or more `token`, zero or more `citation`, then exactly one `done`
/// or one `error`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    Token {
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    Citation {
        source: String,
        page: Option<i32>,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        section_breadcrumb: Option<Vec<String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        image_ids: Option<Vec<Uuid>>,
        document_id: Uuid,
    },
    #[serde(rename_all = "camelCase")]
    Done {
        message_id: Uuid,
        prompt_tokens: usize,
        completion_tokens: usize,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        error_id: Uuid,
        message: String,
    },
}

impl ChatEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            ChatEvent::Token { .. } => "token",
            ChatEvent::Citation { .. } => "citation",
            ChatEvent::Done { .. } => "done",
            ChatEvent::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ChatEvent::Done { .. } | ChatEvent::Error { .. })
    }
}

// ===== RESPONSE MODELS =====

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatsResponse {
    pub status: String,
    pub sessions: i64,
    pub documents: i64,
    pub processing_slots_free: usize,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_event_shape() {
        let json = serde_json::to_value(ChatEvent::Token {
            content: "hi".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "token");
        assert_eq!(json["content"], "hi");
    }

    #[test]
    fn citation_event_shape() {
        let json = serde_json::to_value(ChatEvent::Citation {
            source: "facts.txt".into(),
            page: Some(0),
            text: "Paris is the capital of France.".into(),
            section_breadcrumb: Some(vec!["Geography".into()]),
            image_ids: None,
            document_id: Uuid::nil(),
        })
        .unwrap();
        assert_eq!(json["type"], "citation");
        assert_eq!(json["source"], "facts.txt");
        assert!(json.get("sectionBreadcrumb").is_some());
        assert!(json.get("imageIds").is_none());
        assert!(json.get("documentId").is_some());
    }

    #[test]
    fn terminal_events() {
        assert!(ChatEvent::Done {
            message_id: Uuid::nil(),
            prompt_tokens: 1,
            completion_tokens: 1
        }
        .is_terminal());
        assert!(ChatEvent::Error {
            error_id: Uuid::nil(),
            message: "x".into()
        }
        .is_terminal());
        assert!(!ChatEvent::Token { content: "x".into() }.is_terminal());
    }
}
