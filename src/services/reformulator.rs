//! Multi-turn query reformulation. Classifies the incoming message as
//! standalone or follow-up against the conversation, rewrites it into a
//! self-contained search query, and extracts anchor document ids from the
//! last assistant turn that cited sources. Any model failure serves the
//! original query untouched.

use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::QueryReformulationConfig;
use crate::database::{ChatTurn, Repository};
use crate::index::TurnIndex;
use crate::models::{SessionMode, TurnRole};
use crate::services::embedding_service::EmbeddingProvider;
use crate::services::llm_service::{complete_json, ChatMessage, ChatModel};

#[derive(Debug, Clone, PartialEq)]
pub struct Reformulated {
    pub query: String,
    pub is_follow_up: bool,
    pub anchor_document_ids: Vec<Uuid>,
}

impl Reformulated {
    pub fn passthrough(query: &str) -> Self {
        Self {
            query: query.to_string(),
            is_follow_up: false,
            anchor_document_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReformulationOut {
    #[serde(default)]
    needs_reformulation: bool,
    #[serde(default)]
    is_follow_up: bool,
    #[serde(default)]
    query: String,
    #[serde(default)]
    #[allow(dead_code)]
    reasoning: String,
}

pub struct QueryReformulator {
    repository: Arc<Repository>,
    turn_index: Arc<dyn TurnIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    model: Arc<dyn ChatModel>,
    config: QueryReformulationConfig,
}

impl QueryReformulator {
    pub fn new(
        repository: Arc<Repository>,
        turn_index: Arc<dyn TurnIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        model: Arc<dyn ChatModel>,
        config: QueryReformulationConfig,
    ) -> Self {
        Self {
            repository,
            turn_index,
            embedder,
            model,
            config,
        }
    }

    pub async fn reformulate(
        &self,
        session_id: Uuid,
        query: &str,
        _mode: SessionMode,
    ) -> Reformulated {
        if !self.config.enabled {
            return Reformulated::passthrough(query);
        }

        let recent = match self
            .repository
            .recent_turns(session_id, self.config.min_recent_messages as i64)
            .await
        {
            Ok(turns) => turns,
            Err(e) => {
                warn!(error = %e, "failed to load recent turns, serving original query");
                return Reformulated::passthrough(query);
            }
        };

        if recent.is_empty() {
            // Nothing to reformulate against.
            return Reformulated::passthrough(query);
        }

        let history = self.semantic_history(session_id, query, &recent).await;

        let out: ReformulationOut = match complete_json(
            self.model.as_ref(),
            &build_messages(query, &recent, &history),
            512,
        )
        .await
        {
            Ok(out) => out,
            Err(e) => {
                warn!(error = %e, "reformulation call failed, serving original query");
                return Reformulated::passthrough(query);
            }
        };

        let anchor_document_ids = if out.is_follow_up {
            extract_anchor_ids(&recent)
        } else {
            Vec::new()
        };

        if !out.needs_reformulation {
            return Reformulated {
                query: query.to_string(),
                is_follow_up: out.is_follow_up,
                anchor_document_ids,
            };
        }

        let rewritten = validate_rewrite(query, &out.query, self.config.max_query_length);
        debug!(
            follow_up = out.is_follow_up,
            anchors = anchor_document_ids.len(),
            "query reformulated"
        );

        Reformulated {
            query: rewritten,
            is_follow_up: out.is_follow_up,
            anchor_document_ids,
        }
    }

    /// Up to `history_window` semantically similar prior turns, minus those
    /// already present chronologically (store-fetched turns win).
    async fn semantic_history(
        &self,
        session_id: Uuid,
        query: &str,
        recent: &[ChatTurn],
    ) -> Vec<ChatTurn> {
        let embedding = self.embedder.embed_query(query).await;
        let embedding_opt = if embedding.is_empty() {
            None
        } else {
            Some(embedding.as_slice())
        };

        let similar_ids = match self
            .turn_index
            .similar_turns(session_id, query, embedding_opt, self.config.history_window)
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "turn history search failed, using recent turns only");
                return Vec::new();
            }
        };

        let seen: HashSet<Uuid> = recent.iter().map(|t| t.id).collect();
        let wanted: Vec<Uuid> = similar_ids
            .into_iter()
            .filter(|id| !seen.contains(id))
            .collect();
        if wanted.is_empty() {
            return Vec::new();
        }

        match self.repository.get_turns_by_ids(&wanted).await {
            Ok(turns) => turns,
            Err(e) => {
                warn!(error = %e, "failed to load similar turns");
                Vec::new()
            }
        }
    }
}

fn render_turns(turns: &[ChatTurn]) -> String {
    let mut out = String::new();
    for turn in turns {
        out.push_str(&format!("{}: {}\n", turn.role, turn.content));
    }
    out
}

fn build_messages(query: &str, recent: &[ChatTurn], history: &[ChatTurn]) -> Vec<ChatMessage> {
    // The most recent USER+ASSISTANT pair gets its own block; everything
    // else is broader history.
    let last_pair_start = recent
        .iter()
        .rposition(|t| t.role == TurnRole::User.as_str())
        .unwrap_or(recent.len());
    let (earlier, last_pair) = recent.split_at(last_pair_start);

    let system = "You rewrite user messages into standalone search queries for document \
                  retrieval. Decide whether the message continues the preceding exchange \
                  (a follow-up) and whether it needs rewriting to be searchable on its \
                  own. Reply with ONLY a JSON object {\"needs_reformulation\": bool, \
                  \"is_follow_up\": bool, \"query\": \"...\", \"reasoning\": \"...\"}.";

    let mut user = String::new();
    user.push_str("Most Recent Exchange:\n");
    user.push_str(&render_turns(last_pair));
    user.push_str("\nBroader Conversation History:\n");
    user.push_str(&render_turns(earlier));
    user.push_str(&render_turns(history));
    user.push_str(&format!("\nNew user message: {query}"));

    vec![ChatMessage::system(system), ChatMessage::user(user)]
}

/// A rewrite must be non-empty (else the original survives) and fit the
/// length cap (else it is truncated).
pub fn validate_rewrite(original: &str, rewritten: &str, max_len: usize) -> String {
    let rewritten = rewritten.trim();
    if rewritten.is_empty() {
        return original.to_string();
    }
    if rewritten.chars().count() > max_len {
        return rewritten.chars().take(max_len).collect();
    }
    rewritten.to_string()
}

/// Anchor ids come from the last ASSISTANT turn that recorded retrieved
/// context; the order of ids in that turn is preserved.
pub fn extract_anchor_ids(recent: &[ChatTurn]) -> Vec<Uuid> {
    recent
        .iter()
        .rev()
        .find(|turn| {
            turn.role == TurnRole::Assistant.as_str() && turn.retrieved_context_json.is_some()
        })
        .and_then(|turn| turn.retrieved_context_json.as_ref())
        .map(|json| json.0.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sqlx::types::Json;

    fn turn(role: TurnRole, content: &str, ctx: Option<Vec<Uuid>>) -> ChatTurn {
        ChatTurn {
            id: Uuid::new_v4(),
            session_id: Uuid::nil(),
            role: role.as_str().to_string(),
            content: content.to_string(),
            mode_used: "EXPLORING".to_string(),
            token_count: 5,
            is_compacted: false,
            retrieved_context_json: ctx.map(Json),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn rewrite_validation_keeps_original_when_empty() {
        assert_eq!(validate_rewrite("original", "   ", 100), "original");
    }

    #[test]
    fn rewrite_validation_truncates_long_queries() {
        let long = "w".repeat(600);
        let out = validate_rewrite("orig", &long, 512);
        assert_eq!(out.chars().count(), 512);
    }

    #[test]
    fn anchor_ids_come_from_last_cited_assistant_turn() {
        let early = vec![Uuid::new_v4()];
        let late = vec![Uuid::new_v4(), Uuid::new_v4()];
        let turns = vec![
            turn(TurnRole::User, "q1", None),
            turn(TurnRole::Assistant, "a1", Some(early)),
            turn(TurnRole::User, "q2", None),
            turn(TurnRole::Assistant, "a2", Some(late.clone())),
            turn(TurnRole::User, "q3", None),
        ];
        assert_eq!(extract_anchor_ids(&turns), late);
    }

    #[test]
    fn anchor_ids_empty_without_cited_turns() {
        let turns = vec![
            turn(TurnRole::User, "q", None),
            turn(TurnRole::Assistant, "a", None),
        ];
        assert!(extract_anchor_ids(&turns).is_empty());
    }

    #[test]
    fn prompt_separates_recent_exchange_from_history() {
        let turns = vec![
            turn(TurnRole::User, "old question", None),
            turn(TurnRole::Assistant, "old answer", None),
            turn(TurnRole::User, "newest question", None),
            turn(TurnRole::Assistant, "newest answer", None),
        ];
        let messages = build_messages("follow up?", &turns, &[]);
        let user = &messages[1].content;

        let recent_pos = user.find("Most Recent Exchange").unwrap();
        let history_pos = user.find("Broader Conversation History").unwrap();
        let newest_pos = user.find("newest question").unwrap();
        let old_pos = user.find("old question").unwrap();

        assert!(recent_pos < newest_pos && newest_pos < history_pos);
        assert!(history_pos < old_pos);
    }
}
