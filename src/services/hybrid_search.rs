//! Hybrid retrieval pipeline: lexical and vector candidate pools, engine- or
//! application-side RRF fusion, cross-encoder reranking, and per-document
//! diversity. Every stage has a documented degradation: empty query
//! embedding means keyword-only, a failed engine fusion falls back to
//! in-process RRF, and a failed reranker passes fusion order through.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::RetrievalConfig;
use crate::index::{reciprocal_rank_fusion, ChunkIndex, ChunkRecord, RrfConfig, ScoredChunk};
use crate::models::SessionMode;
use crate::services::embedding_service::EmbeddingProvider;
use crate::services::reranker::Reranker;
use crate::utils::limiters::Limiters;

#[derive(Debug, Clone)]
pub struct RankedChunk {
    pub chunk: ChunkRecord,
    pub rrf_score: f64,
    pub rerank_score: Option<f32>,
}

impl RankedChunk {
    pub fn effective_score(&self) -> f64 {
        self.rerank_score
            .map(f64::from)
            .unwrap_or(self.rrf_score)
    }
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub query: String,
    pub vector_hits: Vec<ScoredChunk>,
    pub bm25_hits: Vec<ScoredChunk>,
    pub final_hits: Vec<RankedChunk>,
}

impl SearchOutcome {
    pub fn empty(query: &str) -> Self {
        Self {
            query: query.to_string(),
            vector_hits: Vec::new(),
            bm25_hits: Vec::new(),
            final_hits: Vec::new(),
        }
    }
}

pub struct HybridSearchService {
    index: Arc<dyn ChunkIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    reranker: Arc<dyn Reranker>,
    config: RetrievalConfig,
    limiters: Arc<Limiters>,
}

impl HybridSearchService {
    pub fn new(
        index: Arc<dyn ChunkIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        reranker: Arc<dyn Reranker>,
        config: RetrievalConfig,
        limiters: Arc<Limiters>,
    ) -> Self {
        Self {
            index,
            embedder,
            reranker,
            config,
            limiters,
        }
    }

    pub async fn search_with_details(
        &self,
        session_id: Uuid,
        query: &str,
        mode: SessionMode,
        anchor_document_ids: Option<&[Uuid]>,
    ) -> Result<SearchOutcome> {
        let retrieval_count = mode.retrieval_count();
        let pool_size = retrieval_count * self.config.candidates_multiplier.max(1);

        let anchor = match anchor_document_ids {
            Some(ids) if self.config.source_anchoring_enabled && !ids.is_empty() => Some(ids),
            _ => None,
        };

        // 1. Query embedding; empty means keyword-only retrieval.
        let embedding = self.embedder.embed_query(query).await;
        if embedding.is_empty() {
            debug!("query embedding unavailable, searching keyword-only");
        }

        let (_permit, wait) = Limiters::acquire_timed(
            self.limiters.search.clone(),
            self.limiters.acquire_timeout,
            "hybrid_search",
        )
        .await?;
        debug!(wait_ms = wait.as_millis() as u64, op = "hybrid_search", "wait_queue");
        let exec_start = Instant::now();

        // 2. Both single-ranker pools; they also feed confidence scoring.
        let (bm25_hits, vector_hits) = tokio::join!(
            self.index
                .bm25_candidates(session_id, query, pool_size, anchor),
            async {
                if embedding.is_empty() {
                    Ok(Vec::new())
                } else {
                    self.index
                        .knn_candidates(session_id, &embedding, pool_size, anchor)
                        .await
                }
            }
        );
        let bm25_hits = bm25_hits?;
        let vector_hits = vector_hits?;

        // 3. Fused candidates: engine-side first, in-process RRF on failure.
        let candidates = match self
            .index
            .hybrid_candidates(
                session_id,
                query,
                if embedding.is_empty() {
                    None
                } else {
                    Some(&embedding)
                },
                pool_size,
                anchor,
            )
            .await
        {
            Ok(hits) => hits
                .into_iter()
                .map(|h| RankedChunk {
                    rrf_score: h.score as f64,
                    rerank_score: None,
                    chunk: h.chunk,
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "engine-side hybrid failed, fusing in-process");
                fuse_candidates(&bm25_hits, &vector_hits, self.config.rrf_k)
            }
        };

        // 4. Cross-encoder rerank; pass through with fusion order on failure.
        let reranked = self.rerank(query, candidates, retrieval_count).await;

        // 5. Per-document diversity, then final truncation.
        let final_hits = diversity_rerank(reranked, self.config.max_per_doc, retrieval_count);

        debug!(
            exec_ms = exec_start.elapsed().as_millis() as u64,
            bm25 = bm25_hits.len(),
            vector = vector_hits.len(),
            finals = final_hits.len(),
            "hybrid search complete"
        );

        Ok(SearchOutcome {
            query: query.to_string(),
            vector_hits,
            bm25_hits,
            final_hits,
        })
    }

    async fn rerank(
        &self,
        query: &str,
        mut candidates: Vec<RankedChunk>,
        retrieval_count: usize,
    ) -> Vec<RankedChunk> {
        let keep = (2 * retrieval_count).max(1);
        if candidates.is_empty() {
            return candidates;
        }

        let passages: Vec<String> = candidates
            .iter()
            .map(|c| c.chunk.enriched_content.clone())
            .collect();

        match self.reranker.rerank(query, &passages).await {
            Ok(scores) if scores.len() == candidates.len() => {
                for (candidate, score) in candidates.iter_mut().zip(scores) {
                    candidate.rerank_score = Some(score);
                }
                candidates.sort_by(|a, b| {
                    b.effective_score()
                        .partial_cmp(&a.effective_score())
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                candidates.truncate(keep);
                candidates
            }
            Ok(_) | Err(_) => {
                // Documented degradation: fall through with RRF ordering.
                warn!("reranker unavailable, keeping fusion order");
                candidates.truncate(keep);
                candidates
            }
        }
    }
}

/// In-process RRF over the two ranked candidate lists.
fn fuse_candidates(
    bm25_hits: &[ScoredChunk],
    vector_hits: &[ScoredChunk],
    rrf_k: u32,
) -> Vec<RankedChunk> {
    let bm25_ids: Vec<Uuid> = bm25_hits.iter().map(|h| h.chunk.id).collect();
    let vector_ids: Vec<Uuid> = vector_hits.iter().map(|h| h.chunk.id).collect();

    let mut by_id: HashMap<Uuid, &ChunkRecord> = HashMap::new();
    for hit in bm25_hits.iter().chain(vector_hits.iter()) {
        by_id.entry(hit.chunk.id).or_insert(&hit.chunk);
    }

    reciprocal_rank_fusion(&[&bm25_ids, &vector_ids], RrfConfig::new(rrf_k))
        .into_iter()
        .filter_map(|(id, score)| {
            by_id.get(&id).map(|chunk| RankedChunk {
                chunk: (*chunk).clone(),
                rrf_score: score,
                rerank_score: None,
            })
        })
        .collect()
}

/// Greedy round-robin by document until each document has contributed
/// `max_per_doc` chunks, then remainder by score; truncated to
/// `final_count`. Keeps a single document from monopolising the top of the
/// context.
pub fn diversity_rerank(
    hits: Vec<RankedChunk>,
    max_per_doc: usize,
    final_count: usize,
) -> Vec<RankedChunk> {
    if hits.is_empty() {
        return hits;
    }
    let max_per_doc = max_per_doc.max(1);

    // Bucket per document, preserving score order within each bucket.
    let mut doc_order: Vec<Uuid> = Vec::new();
    let mut buckets: HashMap<Uuid, Vec<RankedChunk>> = HashMap::new();
    for hit in hits {
        let doc = hit.chunk.document_id;
        if !buckets.contains_key(&doc) {
            doc_order.push(doc);
        }
        buckets.entry(doc).or_default().push(hit);
    }

    let mut out = Vec::new();
    for round in 0..max_per_doc {
        for doc in &doc_order {
            if let Some(bucket) = buckets.get_mut(doc) {
                if round < bucket.len() {
                    out.push(bucket[round].clone());
                }
            }
        }
    }

    // Remainder beyond the per-document cap, by score.
    let mut rest: Vec<RankedChunk> = buckets
        .into_values()
        .flat_map(|bucket| bucket.into_iter().skip(max_per_doc))
        .collect();
    rest.sort_by(|a, b| {
        b.effective_score()
            .partial_cmp(&a.effective_score())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    out.extend(rest);

    out.truncate(final_count);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::RetrievalConfig;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn chunk(id: Uuid, document_id: Uuid, content: &str) -> ChunkRecord {
        ChunkRecord {
            id,
            document_id,
            session_id: Uuid::nil(),
            file_name: "doc.md".into(),
            chunk_index: 0,
            content: content.to_string(),
            context_prefix: None,
            enriched_content: content.to_string(),
            title_embedding: Vec::new(),
            content_embedding: Vec::new(),
            token_count: 10,
            document_title: "doc".into(),
            section_title: String::new(),
            section_breadcrumb: Vec::new(),
            keywords: Vec::new(),
            associated_image_ids: Vec::new(),
        }
    }

    fn ranked(id: Uuid, document_id: Uuid, rrf: f64, rerank: Option<f32>) -> RankedChunk {
        RankedChunk {
            chunk: chunk(id, document_id, "c"),
            rrf_score: rrf,
            rerank_score: rerank,
        }
    }

    struct FakeIndex {
        bm25: Vec<ScoredChunk>,
        knn: Vec<ScoredChunk>,
        hybrid_fails: bool,
        seen_anchor: Mutex<Option<Vec<Uuid>>>,
    }

    impl FakeIndex {
        fn filtered(&self, hits: &[ScoredChunk], anchor: Option<&[Uuid]>) -> Vec<ScoredChunk> {
            hits.iter()
                .filter(|h| anchor.map_or(true, |ids| ids.contains(&h.chunk.document_id)))
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl ChunkIndex for FakeIndex {
        async fn index_chunks(&self, _chunks: &[ChunkRecord]) -> Result<()> {
            Ok(())
        }
        async fn hybrid_candidates(
            &self,
            _session_id: Uuid,
            _query: &str,
            _embedding: Option<&[f32]>,
            _limit: usize,
            anchor: Option<&[Uuid]>,
        ) -> Result<Vec<ScoredChunk>> {
            *self.seen_anchor.lock().unwrap() = anchor.map(|a| a.to_vec());
            if self.hybrid_fails {
                anyhow::bail!("engine fusion down")
            }
            let mut all = self.filtered(&self.bm25, anchor);
            all.extend(self.filtered(&self.knn, anchor));
            all.dedup_by_key(|h| h.chunk.id);
            Ok(all)
        }
        async fn bm25_candidates(
            &self,
            _session_id: Uuid,
            _query: &str,
            _limit: usize,
            anchor: Option<&[Uuid]>,
        ) -> Result<Vec<ScoredChunk>> {
            Ok(self.filtered(&self.bm25, anchor))
        }
        async fn knn_candidates(
            &self,
            _session_id: Uuid,
            _embedding: &[f32],
            _limit: usize,
            anchor: Option<&[Uuid]>,
        ) -> Result<Vec<ScoredChunk>> {
            Ok(self.filtered(&self.knn, anchor))
        }
        async fn delete_document(&self, _document_id: Uuid) -> Result<()> {
            Ok(())
        }
        async fn delete_session(&self, _session_id: Uuid) -> Result<()> {
            Ok(())
        }
        async fn count_session(&self, _session_id: Uuid) -> Result<i64> {
            Ok(0)
        }
    }

    struct FakeEmbedder {
        vector: Vec<f32>,
    }

    #[async_trait]
    impl EmbeddingProvider for FakeEmbedder {
        async fn embed_passage(&self, _text: &str) -> Vec<f32> {
            self.vector.clone()
        }
        async fn embed_query(&self, _text: &str) -> Vec<f32> {
            self.vector.clone()
        }
    }

    struct FakeReranker {
        fail: bool,
        scores: Vec<f32>,
    }

    #[async_trait]
    impl Reranker for FakeReranker {
        async fn rerank(&self, _query: &str, passages: &[String]) -> Result<Vec<f32>> {
            if self.fail {
                anyhow::bail!("reranker down")
            }
            Ok(self
                .scores
                .iter()
                .copied()
                .chain(std::iter::repeat(0.1))
                .take(passages.len())
                .collect())
        }
    }

    fn scored(c: ChunkRecord, score: f32) -> ScoredChunk {
        ScoredChunk { chunk: c, score }
    }

    fn service(
        index: FakeIndex,
        embedder: FakeEmbedder,
        reranker: FakeReranker,
    ) -> HybridSearchService {
        let limits = crate::config::LimitsConfig {
            embedding_concurrency: 4,
            search_concurrency: 4,
            llm_concurrency: 4,
            acquire_timeout_ms: 1_000,
            processing_concurrency: 1,
        };
        HybridSearchService::new(
            Arc::new(index),
            Arc::new(embedder),
            Arc::new(reranker),
            RetrievalConfig {
                candidates_multiplier: 4,
                rrf_k: 60,
                source_anchoring_enabled: true,
                max_per_doc: 2,
            },
            Arc::new(Limiters::new(&limits)),
        )
    }

    #[tokio::test]
    async fn rrf_fallback_ranks_agreed_item_first() {
        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();
        let shared = chunk(Uuid::new_v4(), doc_a, "shared top");
        let only_bm25 = chunk(Uuid::new_v4(), doc_b, "lexical only");
        let only_knn = chunk(Uuid::new_v4(), doc_b, "vector only");

        let index = FakeIndex {
            bm25: vec![scored(shared.clone(), 0.9), scored(only_bm25.clone(), 0.5)],
            knn: vec![scored(shared.clone(), 0.8), scored(only_knn.clone(), 0.4)],
            hybrid_fails: true,
            seen_anchor: Mutex::new(None),
        };
        let svc = service(
            index,
            FakeEmbedder { vector: vec![0.1; 4] },
            FakeReranker {
                fail: true,
                scores: vec![],
            },
        );

        let outcome = svc
            .search_with_details(Uuid::nil(), "q", SessionMode::Exploring, None)
            .await
            .unwrap();

        // Reranker down too: ordering is pure RRF, agreed item first.
        assert_eq!(outcome.final_hits[0].chunk.id, shared.id);
        assert!(outcome.final_hits.iter().all(|h| h.rerank_score.is_none()));
    }

    #[tokio::test]
    async fn anchoring_restricts_final_documents() {
        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();
        let in_anchor = chunk(Uuid::new_v4(), doc_a, "anchored");
        let outside = chunk(Uuid::new_v4(), doc_b, "elsewhere");

        let index = FakeIndex {
            bm25: vec![scored(outside.clone(), 0.9), scored(in_anchor.clone(), 0.8)],
            knn: vec![scored(outside.clone(), 0.9), scored(in_anchor.clone(), 0.8)],
            hybrid_fails: false,
            seen_anchor: Mutex::new(None),
        };
        let svc = service(
            index,
            FakeEmbedder { vector: vec![0.1; 4] },
            FakeReranker {
                fail: false,
                scores: vec![0.9, 0.8],
            },
        );

        let anchor = vec![doc_a];
        let outcome = svc
            .search_with_details(Uuid::nil(), "q", SessionMode::Exploring, Some(&anchor))
            .await
            .unwrap();

        assert!(!outcome.final_hits.is_empty());
        assert!(outcome
            .final_hits
            .iter()
            .all(|h| h.chunk.document_id == doc_a));
    }

    #[tokio::test]
    async fn empty_embedding_degrades_to_keyword_only() {
        let doc = Uuid::new_v4();
        let lexical = chunk(Uuid::new_v4(), doc, "keyword hit");
        let index = FakeIndex {
            bm25: vec![scored(lexical.clone(), 0.7)],
            knn: vec![scored(chunk(Uuid::new_v4(), doc, "unreachable"), 0.9)],
            hybrid_fails: true,
            seen_anchor: Mutex::new(None),
        };
        let svc = service(
            index,
            FakeEmbedder { vector: vec![] },
            FakeReranker {
                fail: true,
                scores: vec![],
            },
        );

        let outcome = svc
            .search_with_details(Uuid::nil(), "q", SessionMode::Exploring, None)
            .await
            .unwrap();

        assert!(outcome.vector_hits.is_empty());
        assert_eq!(outcome.final_hits.len(), 1);
        assert_eq!(outcome.final_hits[0].chunk.id, lexical.id);
    }

    #[tokio::test]
    async fn final_hits_truncate_to_mode_count() {
        let doc_ids: Vec<Uuid> = (0..8).map(|_| Uuid::new_v4()).collect();
        let bm25: Vec<ScoredChunk> = doc_ids
            .iter()
            .map(|&d| scored(chunk(Uuid::new_v4(), d, "c"), 0.5))
            .collect();
        let index = FakeIndex {
            bm25,
            knn: vec![],
            hybrid_fails: false,
            seen_anchor: Mutex::new(None),
        };
        let svc = service(
            index,
            FakeEmbedder { vector: vec![0.1; 4] },
            FakeReranker {
                fail: false,
                scores: vec![0.9; 8],
            },
        );

        let outcome = svc
            .search_with_details(Uuid::nil(), "q", SessionMode::Exploring, None)
            .await
            .unwrap();
        assert_eq!(outcome.final_hits.len(), SessionMode::Exploring.retrieval_count());
    }

    #[test]
    fn diversity_caps_consecutive_same_document() {
        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();
        let hits = vec![
            ranked(Uuid::new_v4(), doc_a, 0.9, Some(0.9)),
            ranked(Uuid::new_v4(), doc_a, 0.8, Some(0.8)),
            ranked(Uuid::new_v4(), doc_a, 0.7, Some(0.7)),
            ranked(Uuid::new_v4(), doc_b, 0.6, Some(0.6)),
        ];

        let out = diversity_rerank(hits, 2, 4);
        let docs: Vec<Uuid> = out.iter().map(|h| h.chunk.document_id).collect();
        // Round-robin: a, b, a, then remainder a.
        assert_eq!(docs, vec![doc_a, doc_b, doc_a, doc_a]);
    }

    #[test]
    fn diversity_truncates() {
        let doc = Uuid::new_v4();
        let hits: Vec<RankedChunk> = (0..6)
            .map(|i| ranked(Uuid::new_v4(), doc, 1.0 - i as f64 * 0.1, None))
            .collect();
        let out = diversity_rerank(hits, 2, 3);
        assert_eq!(out.len(), 3);
    }
}
