//! Topic index: a compact listing of what the session's READY documents
//! cover, with a mode-flavored instruction telling the model how to use it.

use anyhow::Result;
use std::sync::Arc;
use uuid::Uuid;

use crate::database::{Document, Repository};
use crate::models::SessionMode;

pub struct TopicIndexBuilder {
    repository: Arc<Repository>,
}

impl TopicIndexBuilder {
    pub fn new(repository: Arc<Repository>) -> Self {
        Self { repository }
    }

    /// Empty string iff no READY document has topics.
    pub async fn build(&self, session_id: Uuid, mode: SessionMode) -> Result<String> {
        let documents = self
            .repository
            .ready_documents_with_topics(session_id)
            .await?;
        Ok(format_topic_index(&documents, mode))
    }
}

pub fn format_topic_index(documents: &[Document], mode: SessionMode) -> String {
    let mut listing = String::new();
    for document in documents {
        let Some(topics) = document.topics.as_ref().filter(|t| !t.0.is_empty()) else {
            continue;
        };
        listing.push_str(&format!("{}:\n", document.file_name));
        for topic in &topics.0 {
            listing.push_str(&format!("- {topic}\n"));
        }
        listing.push('\n');
    }

    if listing.is_empty() {
        return String::new();
    }

    let instruction = match mode {
        SessionMode::Exploring => {
            "When suggesting follow-up questions, restrict them to topics in this index."
        }
        SessionMode::Research => {
            "Focus the discussion on the documented areas listed in this index."
        }
        SessionMode::Learning => {
            "Use this index to guide which topics the user should study next."
        }
    };

    format!("Topic index of uploaded documents:\n\n{listing}{instruction}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sqlx::types::Json;

    fn document(file_name: &str, topics: Option<Vec<&str>>) -> Document {
        Document {
            id: Uuid::new_v4(),
            session_id: Uuid::nil(),
            file_name: file_name.to_string(),
            mime_type: "text/plain".to_string(),
            file_size: 1,
            status: "READY".to_string(),
            chunk_count: 1,
            summary: None,
            topics: topics.map(|t| Json(t.into_iter().map(String::from).collect())),
            processing_error: None,
            uploaded_at: Utc::now(),
            processed_at: Some(Utc::now()),
        }
    }

    #[test]
    fn lists_files_with_topics() {
        let docs = vec![
            document("geo.txt", Some(vec!["European capitals", "Population data"])),
            document("bio.txt", Some(vec!["Photosynthesis"])),
        ];
        let out = format_topic_index(&docs, SessionMode::Research);
        assert!(out.contains("geo.txt:\n- European capitals\n- Population data"));
        assert!(out.contains("bio.txt:\n- Photosynthesis"));
        assert!(out.contains("Focus the discussion"));
    }

    #[test]
    fn empty_when_no_topics() {
        assert_eq!(format_topic_index(&[], SessionMode::Exploring), "");
        let docs = vec![document("plain.txt", None), document("empty.txt", Some(vec![]))];
        assert_eq!(format_topic_index(&docs, SessionMode::Exploring), "");
    }

    #[test]
    fn mode_changes_instruction() {
        let docs = vec![document("a.txt", Some(vec!["t"]))];
        let exploring = format_topic_index(&docs, SessionMode::Exploring);
        let learning = format_topic_index(&docs, SessionMode::Learning);
        assert!(exploring.contains("restrict them to topics"));
        assert!(learning.contains("study next"));
    }
}
