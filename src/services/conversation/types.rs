//! Seams the chat orchestrator depends on. Each collaborating service
//! implements exactly one of these traits, which keeps the turn pipeline
//! testable with in-memory fakes.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::database::{ChatTurn, Repository, Session, Summary};
use crate::index::TurnIndex;
use crate::models::{SessionMode, TurnRole};
use crate::services::compactor::Compactor;
use crate::services::embedding_service::EmbeddingProvider;
use crate::services::hybrid_search::{HybridSearchService, SearchOutcome};
use crate::services::memory::MemoryEngine;
use crate::services::reformulator::{QueryReformulator, Reformulated};
use crate::services::topic_index::TopicIndexBuilder;
use crate::utils::tasks::TaskPool;

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn load_session(&self, id: Uuid) -> Result<Option<Session>>;

    async fn insert_turn(
        &self,
        session_id: Uuid,
        role: TurnRole,
        content: &str,
        mode: SessionMode,
        token_count: i32,
        retrieved_context: Option<&[Uuid]>,
    ) -> Result<ChatTurn>;

    async fn recent_uncompacted_turns(&self, session_id: Uuid, limit: i64)
        -> Result<Vec<ChatTurn>>;

    async fn recent_summaries(&self, session_id: Uuid, limit: i64) -> Result<Vec<Summary>>;
}

#[async_trait]
impl ConversationStore for Repository {
    async fn load_session(&self, id: Uuid) -> Result<Option<Session>> {
        self.get_session(id).await
    }

    async fn insert_turn(
        &self,
        session_id: Uuid,
        role: TurnRole,
        content: &str,
        mode: SessionMode,
        token_count: i32,
        retrieved_context: Option<&[Uuid]>,
    ) -> Result<ChatTurn> {
        Repository::insert_turn(self, session_id, role, content, mode, token_count, retrieved_context)
            .await
    }

    async fn recent_uncompacted_turns(
        &self,
        session_id: Uuid,
        limit: i64,
    ) -> Result<Vec<ChatTurn>> {
        Repository::recent_uncompacted_turns(self, session_id, limit).await
    }

    async fn recent_summaries(&self, session_id: Uuid, limit: i64) -> Result<Vec<Summary>> {
        Repository::recent_summaries(self, session_id, limit).await
    }
}

#[async_trait]
pub trait QueryRewriter: Send + Sync {
    async fn reformulate(&self, session_id: Uuid, query: &str, mode: SessionMode) -> Reformulated;
}

#[async_trait]
impl QueryRewriter for QueryReformulator {
    async fn reformulate(&self, session_id: Uuid, query: &str, mode: SessionMode) -> Reformulated {
        QueryReformulator::reformulate(self, session_id, query, mode).await
    }
}

#[async_trait]
pub trait ContextRetriever: Send + Sync {
    async fn retrieve(
        &self,
        session_id: Uuid,
        query: &str,
        mode: SessionMode,
        anchor_document_ids: Option<&[Uuid]>,
    ) -> Result<SearchOutcome>;
}

#[async_trait]
impl ContextRetriever for HybridSearchService {
    async fn retrieve(
        &self,
        session_id: Uuid,
        query: &str,
        mode: SessionMode,
        anchor_document_ids: Option<&[Uuid]>,
    ) -> Result<SearchOutcome> {
        self.search_with_details(session_id, query, mode, anchor_document_ids)
            .await
    }
}

#[async_trait]
pub trait MemoryRecall: Send + Sync {
    /// Rendered memory block for the prompt; empty when disabled or empty.
    async fn memory_block(&self, session_id: Uuid, query: &str, limit: usize) -> String;
}

#[async_trait]
impl MemoryRecall for MemoryEngine {
    async fn memory_block(&self, session_id: Uuid, query: &str, limit: usize) -> String {
        MemoryEngine::memory_block(self, session_id, query, limit).await
    }
}

#[async_trait]
pub trait TopicCatalog: Send + Sync {
    async fn topic_index(&self, session_id: Uuid, mode: SessionMode) -> String;
}

#[async_trait]
impl TopicCatalog for TopicIndexBuilder {
    async fn topic_index(&self, session_id: Uuid, mode: SessionMode) -> String {
        match self.build(session_id, mode).await {
            Ok(index) => index,
            Err(e) => {
                warn!(error = %e, "topic index build failed, continuing without it");
                String::new()
            }
        }
    }
}

/// Post-turn side effects, fired after the terminal event: memory
/// extraction, compaction when due, and turn-history indexing. All
/// fire-and-forget on the background pool.
#[async_trait]
pub trait TurnSideEffects: Send + Sync {
    async fn after_turn(
        &self,
        session_id: Uuid,
        user_turn: ChatTurn,
        assistant_turn: ChatTurn,
        mode: SessionMode,
    );
}

pub struct PostTurnTasks {
    memory: Arc<MemoryEngine>,
    compactor: Arc<Compactor>,
    turn_index: Arc<dyn TurnIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    pool: TaskPool,
}

impl PostTurnTasks {
    pub fn new(
        memory: Arc<MemoryEngine>,
        compactor: Arc<Compactor>,
        turn_index: Arc<dyn TurnIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        pool: TaskPool,
    ) -> Self {
        Self {
            memory,
            compactor,
            turn_index,
            embedder,
            pool,
        }
    }
}

#[async_trait]
impl TurnSideEffects for PostTurnTasks {
    async fn after_turn(
        &self,
        session_id: Uuid,
        user_turn: ChatTurn,
        assistant_turn: ChatTurn,
        mode: SessionMode,
    ) {
        let memory = self.memory.clone();
        let user_text = user_turn.content.clone();
        let assistant_text = assistant_turn.content.clone();
        self.pool.spawn("memory_extraction", async move {
            memory
                .extract_and_save(session_id, &user_text, &assistant_text, mode)
                .await
        });

        let compactor = self.compactor.clone();
        self.pool.spawn("compaction", async move {
            compactor.maybe_compact(session_id).await.map(|_| ())
        });

        let turn_index = self.turn_index.clone();
        let embedder = self.embedder.clone();
        self.pool.spawn("turn_indexing", async move {
            for turn in [user_turn, assistant_turn] {
                let embedding = embedder.embed_passage(&turn.content).await;
                turn_index
                    .index_turn(turn.id, session_id, &turn.role, &turn.content, &embedding)
                    .await?;
            }
            Ok(())
        });
    }
}
