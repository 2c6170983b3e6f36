//! Hybrid index contracts. The engine behind them (Postgres with `tsvector`
//! ranking and pgvector kNN here) is an external collaborator; the services
//! only see these traits, which keeps search logic testable with mocks.

pub mod pg;
pub mod rrf;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

pub use pg::{PgChunkIndex, PgMemoryIndex, PgTurnIndex};
pub use rrf::{reciprocal_rank_fusion, RrfConfig};

/// A chunk as written to (and read back from) the hybrid index. Embeddings
/// may be empty when the embedding provider degraded; such chunks remain
/// reachable through lexical ranking only.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub id: Uuid,
    pub document_id: Uuid,
    pub session_id: Uuid,
    pub file_name: String,
    pub chunk_index: i32,
    pub content: String,
    pub context_prefix: Option<String>,
    pub enriched_content: String,
    pub title_embedding: Vec<f32>,
    pub content_embedding: Vec<f32>,
    pub token_count: i32,
    pub document_title: String,
    pub section_title: String,
    pub section_breadcrumb: Vec<String>,
    pub keywords: Vec<String>,
    pub associated_image_ids: Vec<Uuid>,
}

#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: ChunkRecord,
    pub score: f32,
}

#[async_trait]
pub trait ChunkIndex: Send + Sync {
    async fn index_chunks(&self, chunks: &[ChunkRecord]) -> Result<()>;

    /// Engine-side fused retrieval (BM25 + kNN, RRF in the engine). Errors
    /// here make the caller fall back to the two separate searches below.
    async fn hybrid_candidates(
        &self,
        session_id: Uuid,
        query: &str,
        embedding: Option<&[f32]>,
        limit: usize,
        anchor_document_ids: Option<&[Uuid]>,
    ) -> Result<Vec<ScoredChunk>>;

    async fn bm25_candidates(
        &self,
        session_id: Uuid,
        query: &str,
        limit: usize,
        anchor_document_ids: Option<&[Uuid]>,
    ) -> Result<Vec<ScoredChunk>>;

    async fn knn_candidates(
        &self,
        session_id: Uuid,
        embedding: &[f32],
        limit: usize,
        anchor_document_ids: Option<&[Uuid]>,
    ) -> Result<Vec<ScoredChunk>>;

    async fn delete_document(&self, document_id: Uuid) -> Result<()>;

    async fn delete_session(&self, session_id: Uuid) -> Result<()>;

    async fn count_session(&self, session_id: Uuid) -> Result<i64>;
}

#[derive(Debug, Clone)]
pub struct ScoredMemory {
    pub memory_id: Uuid,
    pub score: f32,
}

#[async_trait]
pub trait MemoryIndex: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn index_memory(
        &self,
        memory_id: Uuid,
        session_id: Uuid,
        kind: &str,
        importance: f32,
        content: &str,
        embedding: &[f32],
    ) -> Result<()>;

    async fn bm25_memories(
        &self,
        session_id: Uuid,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ScoredMemory>>;

    async fn knn_memories(
        &self,
        session_id: Uuid,
        embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredMemory>>;

    async fn update_importance(&self, memory_id: Uuid, importance: f32) -> Result<()>;

    async fn delete_memories(&self, memory_ids: &[Uuid]) -> Result<()>;

    async fn delete_session(&self, session_id: Uuid) -> Result<()>;

    /// Request index visibility after a batch of writes. A no-op for engines
    /// with read-your-writes semantics.
    async fn refresh(&self) -> Result<()>;
}

#[async_trait]
pub trait TurnIndex: Send + Sync {
    async fn index_turn(
        &self,
        turn_id: Uuid,
        session_id: Uuid,
        role: &str,
        content: &str,
        embedding: &[f32],
    ) -> Result<()>;

    /// Turn ids semantically similar to the query, best first.
    async fn similar_turns(
        &self,
        session_id: Uuid,
        query: &str,
        embedding: Option<&[f32]>,
        limit: usize,
    ) -> Result<Vec<Uuid>>;

    async fn delete_session(&self, session_id: Uuid) -> Result<()>;
}
