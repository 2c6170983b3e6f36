//! Postgres-backed implementations of the index contracts. Lexical ranking
//! uses `ts_rank_cd` over a stored `tsvector`; vector ranking uses pgvector
//! cosine distance; the engine-side hybrid path is a SQL function that fuses
//! both with RRF inside the database.

use anyhow::Result;
use async_trait::async_trait;
use pgvector::Vector;
use sqlx::types::Json;
use sqlx::FromRow;
use tracing::debug;
use uuid::Uuid;

use super::{ChunkIndex, ChunkRecord, MemoryIndex, ScoredChunk, ScoredMemory, TurnIndex};
use crate::database::DbPool;

const CHUNK_COLUMNS: &str = "id, document_id, session_id, file_name, chunk_index, content, \
     context_prefix, enriched_content, token_count, document_title, section_title, \
     section_breadcrumb, keywords, associated_image_ids";

#[derive(FromRow)]
struct ChunkRow {
    id: Uuid,
    document_id: Uuid,
    session_id: Uuid,
    file_name: String,
    chunk_index: i32,
    content: String,
    context_prefix: Option<String>,
    enriched_content: String,
    token_count: i32,
    document_title: String,
    section_title: String,
    section_breadcrumb: Json<Vec<String>>,
    keywords: Json<Vec<String>>,
    associated_image_ids: Json<Vec<Uuid>>,
    score: f32,
}

impl ChunkRow {
    fn into_scored(self) -> ScoredChunk {
        ScoredChunk {
            chunk: ChunkRecord {
                id: self.id,
                document_id: self.document_id,
                session_id: self.session_id,
                file_name: self.file_name,
                chunk_index: self.chunk_index,
                content: self.content,
                context_prefix: self.context_prefix,
                enriched_content: self.enriched_content,
                title_embedding: Vec::new(),
                content_embedding: Vec::new(),
                token_count: self.token_count,
                document_title: self.document_title,
                section_title: self.section_title,
                section_breadcrumb: self.section_breadcrumb.0,
                keywords: self.keywords.0,
                associated_image_ids: self.associated_image_ids.0,
            },
            score: self.score,
        }
    }
}

fn to_vector(embedding: &[f32]) -> Option<Vector> {
    if embedding.is_empty() {
        None
    } else {
        Some(Vector::from(embedding.to_vec()))
    }
}

pub struct PgChunkIndex {
    pool: DbPool,
}

impl PgChunkIndex {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChunkIndex for PgChunkIndex {
    async fn index_chunks(&self, chunks: &[ChunkRecord]) -> Result<()> {
        let mut tx = self.pool.get_pool().begin().await?;
        for chunk in chunks {
            sqlx::query(
                r#"INSERT INTO chunk_index
                   (id, document_id, session_id, file_name, chunk_index, content,
                    context_prefix, enriched_content, title_embedding, content_embedding,
                    token_count, document_title, section_title, section_breadcrumb,
                    keywords, associated_image_ids)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)"#,
            )
            .bind(chunk.id)
            .bind(chunk.document_id)
            .bind(chunk.session_id)
            .bind(&chunk.file_name)
            .bind(chunk.chunk_index)
            .bind(&chunk.content)
            .bind(&chunk.context_prefix)
            .bind(&chunk.enriched_content)
            .bind(to_vector(&chunk.title_embedding))
            .bind(to_vector(&chunk.content_embedding))
            .bind(chunk.token_count)
            .bind(&chunk.document_title)
            .bind(&chunk.section_title)
            .bind(Json(chunk.section_breadcrumb.clone()))
            .bind(Json(chunk.keywords.clone()))
            .bind(Json(chunk.associated_image_ids.clone()))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(count = chunks.len(), "chunks indexed");
        Ok(())
    }

    async fn hybrid_candidates(
        &self,
        session_id: Uuid,
        query: &str,
        embedding: Option<&[f32]>,
        limit: usize,
        anchor_document_ids: Option<&[Uuid]>,
    ) -> Result<Vec<ScoredChunk>> {
        let vector = embedding.and_then(to_vector);
        let rows = sqlx::query_as::<_, ChunkRow>(
            r#"SELECT * FROM hybrid_search_chunks($1, $2, $3, $4, $5)"#,
        )
        .bind(session_id)
        .bind(query)
        .bind(vector)
        .bind(limit as i32)
        .bind(anchor_document_ids.map(|ids| ids.to_vec()))
        .fetch_all(self.pool.get_pool())
        .await?;

        Ok(rows.into_iter().map(ChunkRow::into_scored).collect())
    }

    async fn bm25_candidates(
        &self,
        session_id: Uuid,
        query: &str,
        limit: usize,
        anchor_document_ids: Option<&[Uuid]>,
    ) -> Result<Vec<ScoredChunk>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, ChunkRow>(&format!(
            r#"SELECT {CHUNK_COLUMNS},
                      ts_rank_cd(tsv, plainto_tsquery('english', $2))::real AS score
               FROM chunk_index
               WHERE session_id = $1
                 AND tsv @@ plainto_tsquery('english', $2)
                 AND ($4::uuid[] IS NULL OR document_id = ANY($4))
               ORDER BY score DESC
               LIMIT $3"#
        ))
        .bind(session_id)
        .bind(query)
        .bind(limit as i64)
        .bind(anchor_document_ids.map(|ids| ids.to_vec()))
        .fetch_all(self.pool.get_pool())
        .await?;

        Ok(rows.into_iter().map(ChunkRow::into_scored).collect())
    }

    async fn knn_candidates(
        &self,
        session_id: Uuid,
        embedding: &[f32],
        limit: usize,
        anchor_document_ids: Option<&[Uuid]>,
    ) -> Result<Vec<ScoredChunk>> {
        let Some(vector) = to_vector(embedding) else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query_as::<_, ChunkRow>(&format!(
            r#"SELECT {CHUNK_COLUMNS},
                      (1 - (content_embedding <=> $2))::real AS score
               FROM chunk_index
               WHERE session_id = $1
                 AND content_embedding IS NOT NULL
                 AND ($4::uuid[] IS NULL OR document_id = ANY($4))
               ORDER BY content_embedding <=> $2
               LIMIT $3"#
        ))
        .bind(session_id)
        .bind(vector)
        .bind(limit as i64)
        .bind(anchor_document_ids.map(|ids| ids.to_vec()))
        .fetch_all(self.pool.get_pool())
        .await?;

        Ok(rows.into_iter().map(ChunkRow::into_scored).collect())
    }

    async fn delete_document(&self, document_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM chunk_index WHERE document_id = $1")
            .bind(document_id)
            .execute(self.pool.get_pool())
            .await?;
        Ok(())
    }

    async fn delete_session(&self, session_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM chunk_index WHERE session_id = $1")
            .bind(session_id)
            .execute(self.pool.get_pool())
            .await?;
        Ok(())
    }

    async fn count_session(&self, session_id: Uuid) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM chunk_index WHERE session_id = $1")
                .bind(session_id)
                .fetch_one(self.pool.get_pool())
                .await?;
        Ok(count)
    }
}

pub struct PgMemoryIndex {
    pool: DbPool,
}

impl PgMemoryIndex {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct ScoredIdRow {
    id: Uuid,
    score: f32,
}

#[async_trait]
impl MemoryIndex for PgMemoryIndex {
    async fn index_memory(
        &self,
        memory_id: Uuid,
        session_id: Uuid,
        kind: &str,
        importance: f32,
        content: &str,
        embedding: &[f32],
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO memory_index (id, session_id, kind, importance, content, embedding, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, now())
               ON CONFLICT (id) DO UPDATE
               SET importance = EXCLUDED.importance,
                   content = EXCLUDED.content,
                   embedding = EXCLUDED.embedding"#,
        )
        .bind(memory_id)
        .bind(session_id)
        .bind(kind)
        .bind(importance)
        .bind(content)
        .bind(to_vector(embedding))
        .execute(self.pool.get_pool())
        .await?;
        Ok(())
    }

    async fn bm25_memories(
        &self,
        session_id: Uuid,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ScoredMemory>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, ScoredIdRow>(
            r#"SELECT id, ts_rank_cd(tsv, plainto_tsquery('english', $2))::real AS score
               FROM memory_index
               WHERE session_id = $1 AND tsv @@ plainto_tsquery('english', $2)
               ORDER BY score DESC
               LIMIT $3"#,
        )
        .bind(session_id)
        .bind(query)
        .bind(limit as i64)
        .fetch_all(self.pool.get_pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| ScoredMemory {
                memory_id: r.id,
                score: r.score,
            })
            .collect())
    }

    async fn knn_memories(
        &self,
        session_id: Uuid,
        embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredMemory>> {
        let Some(vector) = to_vector(embedding) else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query_as::<_, ScoredIdRow>(
            r#"SELECT id, (1 - (embedding <=> $2))::real AS score
               FROM memory_index
               WHERE session_id = $1 AND embedding IS NOT NULL
               ORDER BY embedding <=> $2
               LIMIT $3"#,
        )
        .bind(session_id)
        .bind(vector)
        .bind(limit as i64)
        .fetch_all(self.pool.get_pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| ScoredMemory {
                memory_id: r.id,
                score: r.score,
            })
            .collect())
    }

    async fn update_importance(&self, memory_id: Uuid, importance: f32) -> Result<()> {
        sqlx::query("UPDATE memory_index SET importance = $2 WHERE id = $1")
            .bind(memory_id)
            .bind(importance)
            .execute(self.pool.get_pool())
            .await?;
        Ok(())
    }

    async fn delete_memories(&self, memory_ids: &[Uuid]) -> Result<()> {
        sqlx::query("DELETE FROM memory_index WHERE id = ANY($1)")
            .bind(memory_ids)
            .execute(self.pool.get_pool())
            .await?;
        Ok(())
    }

    async fn delete_session(&self, session_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM memory_index WHERE session_id = $1")
            .bind(session_id)
            .execute(self.pool.get_pool())
            .await?;
        Ok(())
    }

    async fn refresh(&self) -> Result<()> {
        // Postgres reads its own committed writes; nothing to flush.
        Ok(())
    }
}

pub struct PgTurnIndex {
    pool: DbPool,
}

impl PgTurnIndex {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TurnIndex for PgTurnIndex {
    async fn index_turn(
        &self,
        turn_id: Uuid,
        session_id: Uuid,
        role: &str,
        content: &str,
        embedding: &[f32],
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO turn_index (id, session_id, role, content, embedding, created_at)
               VALUES ($1, $2, $3, $4, $5, now())
               ON CONFLICT (id) DO NOTHING"#,
        )
        .bind(turn_id)
        .bind(session_id)
        .bind(role)
        .bind(content)
        .bind(to_vector(embedding))
        .execute(self.pool.get_pool())
        .await?;
        Ok(())
    }

    async fn similar_turns(
        &self,
        session_id: Uuid,
        query: &str,
        embedding: Option<&[f32]>,
        limit: usize,
    ) -> Result<Vec<Uuid>> {
        // Prefer vector similarity; degrade to lexical when the query could
        // not be embedded.
        if let Some(vector) = embedding.and_then(to_vector) {
            let ids: Vec<Uuid> = sqlx::query_scalar(
                r#"SELECT id FROM turn_index
                   WHERE session_id = $1 AND embedding IS NOT NULL
                   ORDER BY embedding <=> $2
                   LIMIT $3"#,
            )
            .bind(session_id)
            .bind(vector)
            .bind(limit as i64)
            .fetch_all(self.pool.get_pool())
            .await?;
            return Ok(ids);
        }

        if query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"SELECT id FROM turn_index
               WHERE session_id = $1 AND tsv @@ plainto_tsquery('english', $2)
               ORDER BY ts_rank_cd(tsv, plainto_tsquery('english', $2)) DESC
               LIMIT $3"#,
        )
        .bind(session_id)
        .bind(query)
        .bind(limit as i64)
        .fetch_all(self.pool.get_pool())
        .await?;
        Ok(ids)
    }

    async fn delete_session(&self, session_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM turn_index WHERE session_id = $1")
            .bind(session_id)
            .execute(self.pool.get_pool())
            .await?;
        Ok(())
    }
}
