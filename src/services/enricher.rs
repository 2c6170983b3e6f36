//! Document enrichment: one structured LLM call per document for a summary
//! plus topic list, and a short contextual prefix per chunk that situates
//! the chunk within the document before embedding.

use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::ContextualChunkingConfig;
use crate::services::llm_service::{complete_json, ChatMessage, ChatModel};

#[derive(Debug, Clone, Default)]
pub struct DocumentAnalysis {
    pub summary: String,
    pub topics: Vec<String>,
}

pub struct Enricher {
    model: Arc<dyn ChatModel>,
    config: ContextualChunkingConfig,
}

#[derive(Debug, Deserialize)]
struct AnalysisOut {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    topics: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SummaryOut {
    #[serde(default)]
    summary: String,
}

#[derive(Debug, Deserialize)]
struct PrefixOut {
    #[serde(default)]
    prefix: String,
}

impl Enricher {
    pub fn new(model: Arc<dyn ChatModel>, config: ContextualChunkingConfig) -> Self {
        Self { model, config }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Summary (800-1000 words) and 5-15 topics in one call. Falls back to a
    /// summary-only call, then to empty fields; never errors.
    pub async fn analyze_document(&self, file_name: &str, full_text: &str) -> DocumentAnalysis {
        let excerpt: String = full_text
            .chars()
            .take(self.config.max_summary_chars)
            .collect();

        let system = "You analyze documents for a retrieval system. Reply with ONLY a JSON \
                      object {\"summary\": \"...\", \"topics\": [\"...\"]}. The summary is \
                      roughly 800-1000 words covering the document's content and structure. \
                      Topics are 5-15 entries, each a 20-40 word description of one theme.";
        let user = format!("File: {file_name}\n\n{excerpt}");
        let messages = [ChatMessage::system(system), ChatMessage::user(user)];

        match complete_json::<AnalysisOut>(self.model.as_ref(), &messages, 2_048).await {
            Ok(out) if !out.summary.is_empty() => {
                debug!(topics = out.topics.len(), "document analysis complete");
                return DocumentAnalysis {
                    summary: out.summary,
                    topics: out.topics,
                };
            }
            Ok(_) => warn!("document analysis returned empty summary, retrying summary-only"),
            Err(e) => warn!(error = %e, "document analysis failed, retrying summary-only"),
        }

        // Fallback: summary only.
        let system = "Summarize the document. Reply with ONLY a JSON object \
                      {\"summary\": \"...\"}.";
        let user = format!("File: {file_name}\n\n{excerpt}");
        let messages = [ChatMessage::system(system), ChatMessage::user(user)];

        match complete_json::<SummaryOut>(self.model.as_ref(), &messages, 1_536).await {
            Ok(out) => DocumentAnalysis {
                summary: out.summary,
                topics: Vec::new(),
            },
            Err(e) => {
                warn!(error = %e, "summary-only fallback failed, document stays unenriched");
                DocumentAnalysis::default()
            }
        }
    }

    /// 1-2 sentence prefix situating the chunk within the document. `None`
    /// when disabled or when the model call fails.
    pub async fn generate_prefix(&self, summary: &str, chunk_content: &str) -> Option<String> {
        if !self.config.enabled || summary.is_empty() {
            return None;
        }

        let system = "Given a document summary and one chunk of that document, write 1-2 \
                      sentences situating the chunk, starting with \"This chunk\" or \
                      \"This section\". Reply with ONLY a JSON object {\"prefix\": \"...\"}.";
        let user = format!("Document summary:\n{summary}\n\nChunk:\n{chunk_content}");
        let messages = [ChatMessage::system(system), ChatMessage::user(user)];

        match complete_json::<PrefixOut>(self.model.as_ref(), &messages, 256).await {
            Ok(out) if !out.prefix.trim().is_empty() => Some(out.prefix.trim().to_string()),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "prefix generation failed, chunk stays raw");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::llm_service::TokenStream;
    use anyhow::Result;
    use async_trait::async_trait;

    struct ScriptedModel(&'static str);

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn complete(&self, _: &[ChatMessage], _: usize, _: f32) -> Result<String> {
            Ok(self.0.to_string())
        }
        async fn stream(&self, _: &[ChatMessage]) -> Result<TokenStream> {
            anyhow::bail!("not used")
        }
    }

    fn enricher(reply: &'static str) -> Enricher {
        Enricher::new(
            std::sync::Arc::new(ScriptedModel(reply)),
            ContextualChunkingConfig {
                enabled: true,
                max_summary_chars: 12_000,
            },
        )
    }

    #[tokio::test]
    async fn analysis_parses_summary_and_topics() {
        let e = enricher(r#"{"summary": "About maps.", "topics": ["Cartography basics"]}"#);
        let analysis = e.analyze_document("maps.pdf", "full text").await;
        assert_eq!(analysis.summary, "About maps.");
        assert_eq!(analysis.topics, vec!["Cartography basics"]);
    }

    #[tokio::test]
    async fn garbage_reply_degrades_to_empty() {
        let e = enricher("no json here at all");
        let analysis = e.analyze_document("x.txt", "text").await;
        assert!(analysis.summary.is_empty());
        assert!(analysis.topics.is_empty());
    }

    #[tokio::test]
    async fn prefix_requires_enabled_and_summary() {
        let e = enricher(r#"{"prefix": "This chunk covers setup."}"#);
        assert!(e.generate_prefix("", "chunk").await.is_none());
        let prefix = e.generate_prefix("doc summary", "chunk").await;
        assert_eq!(prefix.as_deref(), Some("This chunk covers setup."));
    }
}
