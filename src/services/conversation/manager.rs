//! The chat orchestrator: one streamed turn end to end. Reformulate,
//! retrieve (anchored for follow-ups), score confidence, gather prompt
//! sources concurrently, persist the user turn, stream the model, emit
//! citations and the terminal event, persist the assistant turn with its
//! retrieval provenance, then fire the post-turn side effects.
//!
//! Events flow through a bounded channel; the SSE adapter owns the other
//! end. A dropped receiver (client cancel) stops production at the next
//! send, keeps whatever text arrived, and still runs the side effects.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::prompt::{self, PromptInputs};
use super::types::{
    ContextRetriever, ConversationStore, MemoryRecall, QueryRewriter, TopicCatalog,
    TurnSideEffects,
};
use crate::config::ChatConfig;
use crate::models::{ChatEvent, ConfidenceLevel, SessionMode, TurnRole};
use crate::services::confidence::ConfidenceScorer;
use crate::services::hybrid_search::{RankedChunk, SearchOutcome};
use crate::services::llm_service::ChatModel;
use crate::utils::error::ApiError;
use crate::utils::token_estimator;

const MEMORY_LIMIT: usize = 5;
const CITATION_EXCERPT_CHARS: usize = 200;

pub struct ChatOrchestrator {
    store: Arc<dyn ConversationStore>,
    rewriter: Arc<dyn QueryRewriter>,
    retriever: Arc<dyn ContextRetriever>,
    memory: Arc<dyn MemoryRecall>,
    topics: Arc<dyn TopicCatalog>,
    side_effects: Arc<dyn TurnSideEffects>,
    chat_model: Arc<dyn ChatModel>,
    config: ChatConfig,
    anchoring_enabled: bool,
}

impl ChatOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn ConversationStore>,
        rewriter: Arc<dyn QueryRewriter>,
        retriever: Arc<dyn ContextRetriever>,
        memory: Arc<dyn MemoryRecall>,
        topics: Arc<dyn TopicCatalog>,
        side_effects: Arc<dyn TurnSideEffects>,
        chat_model: Arc<dyn ChatModel>,
        config: ChatConfig,
        anchoring_enabled: bool,
    ) -> Self {
        Self {
            store,
            rewriter,
            retriever,
            memory,
            topics,
            side_effects,
            chat_model,
            config,
            anchoring_enabled,
        }
    }

    /// Validate, then hand the turn to a producer task and return the event
    /// stream. The stream always terminates with exactly one `done` or
    /// `error` event.
    pub async fn stream_chat(
        self: Arc<Self>,
        session_id: Uuid,
        user_text: String,
    ) -> Result<ReceiverStream<ChatEvent>, ApiError> {
        if user_text.trim().is_empty() {
            return Err(ApiError::Validation("message cannot be empty".into()));
        }

        let session = self
            .store
            .load_session(session_id)
            .await
            .map_err(|e| ApiError::DatabaseError(e.to_string()))?
            .ok_or(ApiError::SessionNotFound(session_id))?;
        let mode = SessionMode::parse(&session.current_mode).unwrap_or_default();

        let (tx, rx) = mpsc::channel(self.config.stream_channel_capacity.max(1));
        tokio::spawn(async move {
            if let Err(e) = self.clone().produce(&tx, session_id, mode, user_text).await {
                error!(error = %e, session_id = %session_id, "chat turn failed");
                let _ = tx
                    .send(ChatEvent::Error {
                        error_id: Uuid::new_v4(),
                        message: "chat turn failed".to_string(),
                    })
                    .await;
            }
        });

        Ok(ReceiverStream::new(rx))
    }

    async fn produce(
        self: Arc<Self>,
        tx: &mpsc::Sender<ChatEvent>,
        session_id: Uuid,
        mode: SessionMode,
        user_text: String,
    ) -> anyhow::Result<()> {
        let turn_start = Instant::now();

        // 1. Reformulation (falls back to the original query internally).
        let reformulated = self
            .rewriter
            .reformulate(session_id, &user_text, mode)
            .await;

        // 2. Retrieval, anchored to the prior turn's sources on follow-ups.
        let anchor = if reformulated.is_follow_up
            && self.anchoring_enabled
            && !reformulated.anchor_document_ids.is_empty()
        {
            Some(reformulated.anchor_document_ids.as_slice())
        } else {
            None
        };
        let outcome = match self
            .retriever
            .retrieve(session_id, &reformulated.query, mode, anchor)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                // Degrade to an empty context rather than killing the turn.
                warn!(error = %e, "retrieval failed, answering without document context");
                SearchOutcome::empty(&reformulated.query)
            }
        };

        // 3. Confidence; LOW adds a hedging instruction to the prompt.
        let confidence = ConfidenceScorer::score(&outcome);
        debug!(
            score = confidence.score,
            level = ?confidence.level,
            reason = %confidence.reason,
            "retrieval confidence"
        );

        // 4. Prompt sources, gathered concurrently.
        let (memory_block, topic_index, summaries, recent_turns) = tokio::join!(
            self.memory
                .memory_block(session_id, &reformulated.query, MEMORY_LIMIT),
            self.topics.topic_index(session_id, mode),
            self.store
                .recent_summaries(session_id, self.config.recent_summaries as i64),
            self.store
                .recent_uncompacted_turns(session_id, self.config.recent_turns as i64),
        );
        let summaries = summaries.unwrap_or_else(|e| {
            warn!(error = %e, "failed to load summaries");
            Vec::new()
        });
        let recent_turns = recent_turns.unwrap_or_else(|e| {
            warn!(error = %e, "failed to load recent turns");
            Vec::new()
        });

        // 5. Persist the user turn before generation starts.
        let user_turn = self
            .store
            .insert_turn(
                session_id,
                TurnRole::User,
                &user_text,
                mode,
                token_estimator::estimate_tokens(&user_text) as i32,
                None,
            )
            .await?;

        // 6. Assemble under the prompt budget.
        let inputs = PromptInputs {
            mode,
            hedge: confidence.level == ConfidenceLevel::Low,
            topic_index: &topic_index,
            memory_block: &memory_block,
            summaries: &summaries,
            chunks: &outcome.final_hits,
            recent_turns: &recent_turns,
            user_message: &user_text,
        };
        let messages = prompt::assemble(&inputs, self.config.max_prompt_chars);
        let prompt_tokens =
            token_estimator::estimate_total(messages.iter().map(|m| m.content.as_str()));

        // 7. Stream the model.
        let mut assistant_text = String::new();
        let mut client_gone = false;

        match self.chat_model.stream(&messages).await {
            Ok(mut stream) => {
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(token) => {
                            if token.is_empty() {
                                continue;
                            }
                            assistant_text.push_str(&token);
                            if tx
                                .send(ChatEvent::Token { content: token })
                                .await
                                .is_err()
                            {
                                debug!("client disconnected mid-stream");
                                client_gone = true;
                                break;
                            }
                        }
                        Err(e) => {
                            return self
                                .fail_stream(tx, session_id, mode, &assistant_text, e)
                                .await;
                        }
                    }
                }
            }
            Err(e) => {
                return self
                    .fail_stream(tx, session_id, mode, &assistant_text, e)
                    .await;
            }
        }

        // 8. Citations, one per retrieved chunk.
        if !client_gone {
            for hit in &outcome.final_hits {
                if tx.send(citation_event(hit)).await.is_err() {
                    client_gone = true;
                    break;
                }
            }
        }

        // 9. Persist the assistant turn with its provenance.
        let document_ids = unique_document_ids(&outcome.final_hits);
        let assistant_turn = self
            .store
            .insert_turn(
                session_id,
                TurnRole::Assistant,
                &assistant_text,
                mode,
                token_estimator::estimate_tokens(&assistant_text) as i32,
                if document_ids.is_empty() {
                    None
                } else {
                    Some(&document_ids)
                },
            )
            .await?;

        if !client_gone {
            let _ = tx
                .send(ChatEvent::Done {
                    message_id: assistant_turn.id,
                    prompt_tokens,
                    completion_tokens: token_estimator::estimate_tokens(&assistant_text),
                })
                .await;
        }

        info!(
            session_id = %session_id,
            duration_ms = turn_start.elapsed().as_millis() as u64,
            chunks = outcome.final_hits.len(),
            cancelled = client_gone,
            "chat turn complete"
        );

        // 10. Fire-and-forget side effects; they run even after a cancel.
        self.side_effects
            .after_turn(session_id, user_turn, assistant_turn, mode)
            .await;

        Ok(())
    }

    /// Terminal failure path: one `error` event, partial assistant text
    /// persisted and marked.
    async fn fail_stream(
        &self,
        tx: &mpsc::Sender<ChatEvent>,
        session_id: Uuid,
        mode: SessionMode,
        partial_text: &str,
        cause: anyhow::Error,
    ) -> anyhow::Result<()> {
        let error_id = Uuid::new_v4();
        error!(error = %cause, %error_id, "LLM stream failed");
        let _ = tx
            .send(ChatEvent::Error {
                error_id,
                message: "the model stream failed; partial output was kept".to_string(),
            })
            .await;

        if !partial_text.is_empty() {
            let marked = format!("{partial_text}\n\n[response interrupted]");
            if let Err(e) = self
                .store
                .insert_turn(
                    session_id,
                    TurnRole::Assistant,
                    &marked,
                    mode,
                    token_estimator::estimate_tokens(&marked) as i32,
                    None,
                )
                .await
            {
                error!(error = %e, "failed to persist partial assistant turn");
            }
        }
        Ok(())
    }
}

fn citation_event(hit: &RankedChunk) -> ChatEvent {
    let chunk = &hit.chunk;
    ChatEvent::Citation {
        source: chunk.file_name.clone(),
        page: Some(chunk.chunk_index),
        text: chunk
            .content
            .chars()
            .take(CITATION_EXCERPT_CHARS)
            .collect(),
        section_breadcrumb: if chunk.section_breadcrumb.is_empty() {
            None
        } else {
            Some(chunk.section_breadcrumb.clone())
        },
        image_ids: if chunk.associated_image_ids.is_empty() {
            None
        } else {
            Some(chunk.associated_image_ids.clone())
        },
        document_id: chunk.document_id,
    }
}

/// Ordered unique document ids over the final chunks.
pub fn unique_document_ids(hits: &[RankedChunk]) -> Vec<Uuid> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for hit in hits {
        if seen.insert(hit.chunk.document_id) {
            out.push(hit.chunk.document_id);
        }
    }
    out
}
