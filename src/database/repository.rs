use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use tracing::debug;
use uuid::Uuid;

use super::models::{ChatTurn, Document, DocumentImage, MemoryRecord, Session, Summary};
use super::pool::DbPool;
use crate::models::{DocumentStatus, MemoryKind, SessionMode, TurnRole};

pub struct Repository {
    pool: DbPool,
}

impl Repository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &sqlx::PgPool {
        self.pool.get_pool()
    }

    // ===== Sessions =====

    pub async fn create_session(&self, title: &str, mode: SessionMode) -> Result<Session> {
        let session = sqlx::query_as::<_, Session>(
            r#"INSERT INTO sessions (id, title, current_mode, created_at, updated_at)
               VALUES ($1, $2, $3, now(), now())
               RETURNING *"#,
        )
        .bind(Uuid::new_v4())
        .bind(title)
        .bind(mode.as_str())
        .fetch_one(self.pool())
        .await?;

        Ok(session)
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        let sessions = sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions ORDER BY updated_at DESC",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(sessions)
    }

    pub async fn get_session(&self, id: Uuid) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(session)
    }

    pub async fn update_session(
        &self,
        id: Uuid,
        title: Option<&str>,
        mode: Option<SessionMode>,
    ) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(
            r#"UPDATE sessions
               SET title = COALESCE($2, title),
                   current_mode = COALESCE($3, current_mode),
                   updated_at = now()
               WHERE id = $1
               RETURNING *"#,
        )
        .bind(id)
        .bind(title)
        .bind(mode.map(|m| m.as_str()))
        .fetch_optional(self.pool())
        .await?;
        Ok(session)
    }

    /// Relational part of session deletion, one transaction. Index and blob
    /// cleanup happen before this is called and do not block it.
    pub async fn delete_session_rows(&self, id: Uuid) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM memories WHERE session_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM summaries WHERE session_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chat_turns WHERE session_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM document_images WHERE session_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE session_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        debug!(session_id = %id, "session rows deleted");
        Ok(())
    }

    // ===== Documents =====

    pub async fn insert_document(
        &self,
        session_id: Uuid,
        file_name: &str,
        mime_type: &str,
        file_size: i64,
    ) -> Result<Document> {
        let doc = sqlx::query_as::<_, Document>(
            r#"INSERT INTO documents
               (id, session_id, file_name, mime_type, file_size, status, chunk_count, uploaded_at)
               VALUES ($1, $2, $3, $4, $5, $6, 0, now())
               RETURNING *"#,
        )
        .bind(Uuid::new_v4())
        .bind(session_id)
        .bind(file_name)
        .bind(mime_type)
        .bind(file_size)
        .bind(DocumentStatus::Pending.as_str())
        .fetch_one(self.pool())
        .await?;
        Ok(doc)
    }

    pub async fn list_documents(&self, session_id: Uuid) -> Result<Vec<Document>> {
        let docs = sqlx::query_as::<_, Document>(
            "SELECT * FROM documents WHERE session_id = $1 ORDER BY uploaded_at DESC",
        )
        .bind(session_id)
        .fetch_all(self.pool())
        .await?;
        Ok(docs)
    }

    pub async fn get_document(&self, id: Uuid) -> Result<Option<Document>> {
        let doc = sqlx::query_as::<_, Document>("SELECT * FROM documents WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(doc)
    }

    pub async fn mark_document_processing(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE documents SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(DocumentStatus::Processing.as_str())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn mark_document_ready(
        &self,
        id: Uuid,
        chunk_count: i32,
        summary: Option<&str>,
        topics: &[String],
    ) -> Result<()> {
        sqlx::query(
            r#"UPDATE documents
               SET status = $2, chunk_count = $3, summary = $4, topics = $5,
                   processing_error = NULL, processed_at = now()
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(DocumentStatus::Ready.as_str())
        .bind(chunk_count)
        .bind(summary)
        .bind(Json(topics.to_vec()))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn mark_document_failed(&self, id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            r#"UPDATE documents
               SET status = $2, processing_error = $3, processed_at = now()
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(DocumentStatus::Failed.as_str())
        .bind(error)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn delete_document_rows(&self, id: Uuid) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM document_images WHERE document_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// READY documents whose topics list is non-empty, for the topic index.
    pub async fn ready_documents_with_topics(&self, session_id: Uuid) -> Result<Vec<Document>> {
        let docs = sqlx::query_as::<_, Document>(
            r#"SELECT * FROM documents
               WHERE session_id = $1 AND status = $2
                 AND topics IS NOT NULL AND jsonb_array_length(topics) > 0
               ORDER BY uploaded_at ASC"#,
        )
        .bind(session_id)
        .bind(DocumentStatus::Ready.as_str())
        .fetch_all(self.pool())
        .await?;
        Ok(docs)
    }

    // ===== Images =====

    pub async fn insert_images(&self, images: &[DocumentImage]) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        for image in images {
            sqlx::query(
                r#"INSERT INTO document_images
                   (id, document_id, session_id, image_index, mime_type, alt_text, file_path,
                    width, height, page_number, x_pdf, y_pdf, spatial_group_id)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"#,
            )
            .bind(image.id)
            .bind(image.document_id)
            .bind(image.session_id)
            .bind(image.image_index)
            .bind(&image.mime_type)
            .bind(&image.alt_text)
            .bind(&image.file_path)
            .bind(image.width)
            .bind(image.height)
            .bind(image.page_number)
            .bind(image.x_pdf)
            .bind(image.y_pdf)
            .bind(image.spatial_group_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_image(&self, session_id: Uuid, image_id: Uuid) -> Result<Option<DocumentImage>> {
        let image = sqlx::query_as::<_, DocumentImage>(
            "SELECT * FROM document_images WHERE id = $1 AND session_id = $2",
        )
        .bind(image_id)
        .bind(session_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(image)
    }

    // ===== Chat turns =====

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_turn(
        &self,
        session_id: Uuid,
        role: TurnRole,
        content: &str,
        mode: SessionMode,
        token_count: i32,
        retrieved_context: Option<&[Uuid]>,
    ) -> Result<ChatTurn> {
        let turn = sqlx::query_as::<_, ChatTurn>(
            r#"INSERT INTO chat_turns
               (id, session_id, role, content, mode_used, token_count, is_compacted,
                retrieved_context_json, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, false, $7, now())
               RETURNING *"#,
        )
        .bind(Uuid::new_v4())
        .bind(session_id)
        .bind(role.as_str())
        .bind(content)
        .bind(mode.as_str())
        .bind(token_count)
        .bind(retrieved_context.map(|ids| Json(ids.to_vec())))
        .fetch_one(self.pool())
        .await?;
        Ok(turn)
    }

    pub async fn update_turn_content(
        &self,
        id: Uuid,
        content: &str,
        token_count: i32,
    ) -> Result<()> {
        sqlx::query("UPDATE chat_turns SET content = $2, token_count = $3 WHERE id = $1")
            .bind(id)
            .bind(content)
            .bind(token_count)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Most recent `limit` turns, returned oldest-first.
    pub async fn recent_turns(&self, session_id: Uuid, limit: i64) -> Result<Vec<ChatTurn>> {
        let mut turns = sqlx::query_as::<_, ChatTurn>(
            r#"SELECT * FROM chat_turns
               WHERE session_id = $1
               ORDER BY created_at DESC
               LIMIT $2"#,
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        turns.reverse();
        Ok(turns)
    }

    /// Most recent `limit` non-compacted turns, oldest-first.
    pub async fn recent_uncompacted_turns(
        &self,
        session_id: Uuid,
        limit: i64,
    ) -> Result<Vec<ChatTurn>> {
        let mut turns = sqlx::query_as::<_, ChatTurn>(
            r#"SELECT * FROM chat_turns
               WHERE session_id = $1 AND is_compacted = false
               ORDER BY created_at DESC
               LIMIT $2"#,
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        turns.reverse();
        Ok(turns)
    }

    pub async fn get_turns_by_ids(&self, ids: &[Uuid]) -> Result<Vec<ChatTurn>> {
        let turns = sqlx::query_as::<_, ChatTurn>(
            "SELECT * FROM chat_turns WHERE id = ANY($1) ORDER BY created_at ASC",
        )
        .bind(ids)
        .fetch_all(self.pool())
        .await?;
        Ok(turns)
    }

    pub async fn uncompacted_turns_oldest_first(&self, session_id: Uuid) -> Result<Vec<ChatTurn>> {
        let turns = sqlx::query_as::<_, ChatTurn>(
            r#"SELECT * FROM chat_turns
               WHERE session_id = $1 AND is_compacted = false
               ORDER BY created_at ASC"#,
        )
        .bind(session_id)
        .fetch_all(self.pool())
        .await?;
        Ok(turns)
    }

    pub async fn sum_uncompacted_tokens(&self, session_id: Uuid) -> Result<i64> {
        let sum: Option<i64> = sqlx::query_scalar(
            r#"SELECT SUM(token_count)::BIGINT FROM chat_turns
               WHERE session_id = $1 AND is_compacted = false"#,
        )
        .bind(session_id)
        .fetch_one(self.pool())
        .await?;
        Ok(sum.unwrap_or(0))
    }

    // ===== Summaries =====

    /// Write a summary and mark the turns it covers, atomically.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_summary_compacting(
        &self,
        session_id: Uuid,
        summary_content: &str,
        message_count: i32,
        token_count: i32,
        original_token_count: i32,
        from_timestamp: DateTime<Utc>,
        to_timestamp: DateTime<Utc>,
        turn_ids: &[Uuid],
    ) -> Result<Summary> {
        let mut tx = self.pool().begin().await?;
        let summary = sqlx::query_as::<_, Summary>(
            r#"INSERT INTO summaries
               (id, session_id, summary_content, message_count, token_count,
                original_token_count, from_timestamp, to_timestamp, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now())
               RETURNING *"#,
        )
        .bind(Uuid::new_v4())
        .bind(session_id)
        .bind(summary_content)
        .bind(message_count)
        .bind(token_count)
        .bind(original_token_count)
        .bind(from_timestamp)
        .bind(to_timestamp)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("UPDATE chat_turns SET is_compacted = true WHERE id = ANY($1)")
            .bind(turn_ids)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(summary)
    }

    /// Most recent summaries, newest first.
    pub async fn recent_summaries(&self, session_id: Uuid, limit: i64) -> Result<Vec<Summary>> {
        let summaries = sqlx::query_as::<_, Summary>(
            r#"SELECT * FROM summaries
               WHERE session_id = $1
               ORDER BY created_at DESC
               LIMIT $2"#,
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(summaries)
    }

    // ===== Memories =====

    pub async fn insert_memory(
        &self,
        session_id: Uuid,
        content: &str,
        kind: MemoryKind,
        importance: f32,
    ) -> Result<MemoryRecord> {
        let memory = sqlx::query_as::<_, MemoryRecord>(
            r#"INSERT INTO memories
               (id, session_id, content, kind, importance, created_at, last_accessed_at)
               VALUES ($1, $2, $3, $4, $5, now(), now())
               RETURNING *"#,
        )
        .bind(Uuid::new_v4())
        .bind(session_id)
        .bind(content)
        .bind(kind.as_str())
        .bind(importance)
        .fetch_one(self.pool())
        .await?;
        Ok(memory)
    }

    pub async fn list_memories(&self, session_id: Uuid) -> Result<Vec<MemoryRecord>> {
        let memories = sqlx::query_as::<_, MemoryRecord>(
            "SELECT * FROM memories WHERE session_id = $1 ORDER BY created_at ASC",
        )
        .bind(session_id)
        .fetch_all(self.pool())
        .await?;
        Ok(memories)
    }

    pub async fn get_memories_by_ids(&self, ids: &[Uuid]) -> Result<Vec<MemoryRecord>> {
        let memories = sqlx::query_as::<_, MemoryRecord>(
            "SELECT * FROM memories WHERE id = ANY($1)",
        )
        .bind(ids)
        .fetch_all(self.pool())
        .await?;
        Ok(memories)
    }

    pub async fn update_memory_importance(&self, id: Uuid, importance: f32) -> Result<()> {
        sqlx::query("UPDATE memories SET importance = $2 WHERE id = $1")
            .bind(id)
            .bind(importance)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn touch_memories(&self, ids: &[Uuid]) -> Result<()> {
        sqlx::query("UPDATE memories SET last_accessed_at = now() WHERE id = ANY($1)")
            .bind(ids)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn delete_memories(&self, ids: &[Uuid]) -> Result<()> {
        sqlx::query("DELETE FROM memories WHERE id = ANY($1)")
            .bind(ids)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn count_memories(&self, session_id: Uuid) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM memories WHERE session_id = $1")
            .bind(session_id)
            .fetch_one(self.pool())
            .await?;
        Ok(count)
    }

    pub async fn lowest_importance_memories(
        &self,
        session_id: Uuid,
        limit: i64,
    ) -> Result<Vec<MemoryRecord>> {
        let memories = sqlx::query_as::<_, MemoryRecord>(
            r#"SELECT * FROM memories
               WHERE session_id = $1
               ORDER BY importance ASC, created_at ASC
               LIMIT $2"#,
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(memories)
    }

    // ===== Stats =====

    pub async fn count_sessions(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM sessions")
            .fetch_one(self.pool())
            .await?)
    }

    pub async fn count_documents(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(self.pool())
            .await?)
    }
}
