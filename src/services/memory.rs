//! Session memory: distilled facts, preferences and insights extracted from
//! each exchange, deduplicated by normalized content, retrieved by blending
//! semantic relevance with importance, and pruned at a per-session cap.

use anyhow::Result;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::MemoryConfig;
use crate::database::{MemoryRecord, Repository};
use crate::index::{reciprocal_rank_fusion, MemoryIndex, RrfConfig};
use crate::models::{MemoryKind, SessionMode};
use crate::services::embedding_service::EmbeddingProvider;
use crate::services::llm_service::{complete_json, ChatMessage, ChatModel};

pub const IMPORTANCE_BUMP: f32 = 0.1;

#[derive(Debug, Deserialize)]
struct ExtractionOut {
    #[serde(default)]
    memories: Vec<ExtractedMemory>,
}

#[derive(Debug, Deserialize)]
struct ExtractedMemory {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    importance: f32,
}

pub struct MemoryEngine {
    repository: Arc<Repository>,
    index: Arc<dyn MemoryIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    model: Arc<dyn ChatModel>,
    config: MemoryConfig,
}

impl MemoryEngine {
    pub fn new(
        repository: Arc<Repository>,
        index: Arc<dyn MemoryIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        model: Arc<dyn ChatModel>,
        config: MemoryConfig,
    ) -> Self {
        Self {
            repository,
            index,
            embedder,
            model,
            config,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Distill durable memories from one exchange. Runs off the reply path;
    /// all failures are logged, never surfaced to the user.
    pub async fn extract_and_save(
        &self,
        session_id: Uuid,
        user_message: &str,
        assistant_message: &str,
        _mode: SessionMode,
    ) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let system = "Extract durable memories about the user and the conversation from \
                      this exchange. A memory is a short standalone statement worth \
                      remembering across future turns. Reply with ONLY a JSON object \
                      {\"memories\": [{\"type\": \"fact\"|\"preference\"|\"insight\", \
                      \"content\": \"...\", \"importance\": 0.0-1.0}]}. Return an empty \
                      list when nothing is worth keeping.";
        let user = format!("User: {user_message}\n\nAssistant: {assistant_message}");
        let messages = [ChatMessage::system(system), ChatMessage::user(user)];

        let extracted: ExtractionOut =
            complete_json(self.model.as_ref(), &messages, 768).await?;

        let existing = self.repository.list_memories(session_id).await?;
        let mut inserted = 0usize;

        for entry in extracted.memories {
            if entry.importance < self.config.extraction_threshold {
                continue;
            }
            let Some(kind) = MemoryKind::parse(&entry.kind) else {
                warn!(kind = %entry.kind, "unknown memory type, dropping entry");
                continue;
            };
            let content = entry.content.trim();
            if content.is_empty() {
                continue;
            }

            if let Some(existing_match) = find_duplicate(&existing, content) {
                let bumped = (existing_match.importance + IMPORTANCE_BUMP).min(1.0);
                self.repository
                    .update_memory_importance(existing_match.id, bumped)
                    .await?;
                if let Err(e) = self.index.update_importance(existing_match.id, bumped).await {
                    warn!(error = %e, "memory index importance update failed");
                }
                debug!(memory_id = %existing_match.id, bumped, "duplicate memory, importance bumped");
                continue;
            }

            let record = self
                .repository
                .insert_memory(session_id, content, kind, entry.importance.clamp(0.0, 1.0))
                .await?;

            // Stored with the passage (query-agnostic) instruction prefix.
            let embedding = self.embedder.embed_passage(content).await;
            if let Err(e) = self
                .index
                .index_memory(
                    record.id,
                    session_id,
                    kind.as_str(),
                    record.importance,
                    content,
                    &embedding,
                )
                .await
            {
                // Recoverable-local: the relational row survives, the index
                // entry can be rebuilt.
                warn!(error = %e, memory_id = %record.id, "memory index write failed");
            }
            inserted += 1;
        }

        self.prune(session_id).await?;

        if inserted > 0 {
            if let Err(e) = self.index.refresh().await {
                warn!(error = %e, "memory index refresh failed");
            }
        }
        debug!(inserted, "memory extraction finished");
        Ok(())
    }

    async fn prune(&self, session_id: Uuid) -> Result<()> {
        let count = self.repository.count_memories(session_id).await?;
        let max = self.config.max_per_session as i64;
        if count <= max {
            return Ok(());
        }

        let excess = count - max;
        let victims = self
            .repository
            .lowest_importance_memories(session_id, excess)
            .await?;
        let ids: Vec<Uuid> = victims.iter().map(|m| m.id).collect();

        self.repository.delete_memories(&ids).await?;
        if let Err(e) = self.index.delete_memories(&ids).await {
            warn!(error = %e, "memory index prune failed");
        }
        debug!(pruned = ids.len(), "memories pruned to cap");
        Ok(())
    }

    /// Hybrid recall: RRF over lexical and vector pools, relevance
    /// normalized to [0,1], blended with importance.
    pub async fn get_relevant_memories(
        &self,
        session_id: Uuid,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        if !self.config.enabled || limit == 0 {
            return Ok(Vec::new());
        }

        let pool = limit * self.config.candidate_pool_multiplier.max(1);
        let embedding = self.embedder.embed_query(query).await;

        let (lexical, semantic) = tokio::join!(
            self.index.bm25_memories(session_id, query, pool),
            async {
                if embedding.is_empty() {
                    Ok(Vec::new())
                } else {
                    self.index.knn_memories(session_id, &embedding, pool).await
                }
            }
        );
        let lexical = lexical.unwrap_or_else(|e| {
            warn!(error = %e, "lexical memory search failed");
            Vec::new()
        });
        let semantic = semantic.unwrap_or_else(|e| {
            warn!(error = %e, "vector memory search failed");
            Vec::new()
        });

        let lexical_ids: Vec<Uuid> = lexical.iter().map(|m| m.memory_id).collect();
        let semantic_ids: Vec<Uuid> = semantic.iter().map(|m| m.memory_id).collect();
        let fused = reciprocal_rank_fusion(&[&lexical_ids, &semantic_ids], RrfConfig::default());
        if fused.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = fused.iter().map(|(id, _)| *id).collect();
        let records = self.repository.get_memories_by_ids(&ids).await?;
        let by_id: HashMap<Uuid, MemoryRecord> =
            records.into_iter().map(|r| (r.id, r)).collect();

        let relevance: HashMap<Uuid, f64> = fused.iter().copied().collect();
        let selected = blend_and_select(
            &ids,
            &by_id,
            &relevance,
            self.config.semantic_weight,
            limit,
        );

        let selected_ids: Vec<Uuid> = selected.iter().map(|m| m.id).collect();
        if let Err(e) = self.repository.touch_memories(&selected_ids).await {
            warn!(error = %e, "failed to touch memory access timestamps");
        }

        Ok(selected)
    }

    /// Everything the orchestrator needs for the prompt in one call.
    pub async fn memory_block(&self, session_id: Uuid, query: &str, limit: usize) -> String {
        match self.get_relevant_memories(session_id, query, limit).await {
            Ok(memories) => build_memory_context(&memories),
            Err(e) => {
                warn!(error = %e, "memory recall failed, continuing without memories");
                String::new()
            }
        }
    }

    pub async fn delete_session(&self, session_id: Uuid) -> Result<()> {
        self.index.delete_session(session_id).await
    }
}

pub fn normalize(content: &str) -> String {
    content.trim().to_lowercase()
}

/// Duplicate when normalized contents are equal or one contains the other.
pub fn is_duplicate(a: &str, b: &str) -> bool {
    let (a, b) = (normalize(a), normalize(b));
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a == b || a.contains(&b) || b.contains(&a)
}

fn find_duplicate<'a>(existing: &'a [MemoryRecord], content: &str) -> Option<&'a MemoryRecord> {
    existing.iter().find(|m| is_duplicate(&m.content, content))
}

/// `hybrid = w * normalized_relevance + (1 - w) * importance`, top `limit`.
fn blend_and_select(
    ordered_ids: &[Uuid],
    by_id: &HashMap<Uuid, MemoryRecord>,
    relevance: &HashMap<Uuid, f64>,
    semantic_weight: f32,
    limit: usize,
) -> Vec<MemoryRecord> {
    let max_rel = relevance
        .values()
        .fold(0.0f64, |acc, &v| acc.max(v))
        .max(f64::EPSILON);

    let mut scored: Vec<(f32, &MemoryRecord)> = ordered_ids
        .iter()
        .filter_map(|id| by_id.get(id).map(|record| (id, record)))
        .map(|(id, record)| {
            let rel = (relevance.get(id).copied().unwrap_or(0.0) / max_rel) as f32;
            let hybrid = semantic_weight * rel + (1.0 - semantic_weight) * record.importance;
            (hybrid, record)
        })
        .collect();

    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored
        .into_iter()
        .take(limit)
        .map(|(_, record)| record.clone())
        .collect()
}

pub fn build_memory_context(memories: &[MemoryRecord]) -> String {
    if memories.is_empty() {
        return String::new();
    }
    let mut out = String::from("Relevant memories from this session:\n");
    for memory in memories {
        out.push_str(&format!(
            "- [{}] {} (importance: {:.1})\n",
            memory.kind.to_uppercase(),
            memory.content,
            memory.importance
        ));
    }
    out
}
