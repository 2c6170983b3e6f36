//! Retrieval confidence scoring. Four fixed-weight signals over the search
//! outcome: best rerank score, agreement between the lexical and vector
//! top-5, rerank score dispersion (a discriminative reranker spreads its
//! scores), and a query-length proxy. The orchestrator prepends a hedging
//! instruction when the level lands at LOW.

use std::collections::HashSet;
use uuid::Uuid;

use crate::models::ConfidenceLevel;
use crate::services::hybrid_search::SearchOutcome;
use crate::utils::similarity::jaccard;

const WEIGHT_TOP_SCORE: f32 = 0.45;
const WEIGHT_AGREEMENT: f32 = 0.25;
const WEIGHT_DISPERSION: f32 = 0.20;
const WEIGHT_QUERY_LENGTH: f32 = 0.10;

const AGREEMENT_TOP_K: usize = 5;

#[derive(Debug, Clone)]
pub struct Confidence {
    pub score: f32,
    pub level: ConfidenceLevel,
    pub reason: String,
}

pub struct ConfidenceScorer;

impl ConfidenceScorer {
    pub fn score(outcome: &SearchOutcome) -> Confidence {
        if outcome.final_hits.is_empty() {
            return Confidence {
                score: 0.0,
                level: ConfidenceLevel::Low,
                reason: "no results retrieved".to_string(),
            };
        }

        let top_score = outcome
            .final_hits
            .iter()
            .filter_map(|h| h.rerank_score)
            .fold(f32::NEG_INFINITY, f32::max);
        // Without rerank scores, fall back to a neutral mid value rather
        // than trusting unbounded fusion scores.
        let top_score = if top_score.is_finite() {
            top_score.clamp(0.0, 1.0)
        } else {
            0.5
        };

        let agreement = top_k_agreement(outcome, AGREEMENT_TOP_K);
        let dispersion = score_dispersion(outcome);
        let query_length = query_length_signal(&outcome.query);

        let score = (WEIGHT_TOP_SCORE * top_score
            + WEIGHT_AGREEMENT * agreement
            + WEIGHT_DISPERSION * dispersion
            + WEIGHT_QUERY_LENGTH * query_length)
            .clamp(0.0, 1.0);

        let level = ConfidenceLevel::from_score(score);
        let reason = format!(
            "top={top_score:.2} agreement={agreement:.2} dispersion={dispersion:.2} query={query_length:.2}"
        );

        Confidence {
            score,
            level,
            reason,
        }
    }
}

/// Jaccard overlap of the top-K chunk ids from each single-ranker pool.
fn top_k_agreement(outcome: &SearchOutcome, k: usize) -> f32 {
    let vector: HashSet<Uuid> = outcome
        .vector_hits
        .iter()
        .take(k)
        .map(|h| h.chunk.id)
        .collect();
    let bm25: HashSet<Uuid> = outcome
        .bm25_hits
        .iter()
        .take(k)
        .map(|h| h.chunk.id)
        .collect();

    if vector.is_empty() || bm25.is_empty() {
        // One ranker degraded; agreement is unknowable, not zero-confidence.
        return 0.3;
    }
    jaccard(&vector, &bm25)
}

/// Normalized standard deviation of the rerank scores. Higher spread means
/// the reranker separated good passages from filler.
fn score_dispersion(outcome: &SearchOutcome) -> f32 {
    let scores: Vec<f32> = outcome
        .final_hits
        .iter()
        .filter_map(|h| h.rerank_score)
        .collect();
    if scores.len() < 2 {
        return 0.0;
    }

    let mean = scores.iter().sum::<f32>() / scores.len() as f32;
    let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f32>() / scores.len() as f32;
    let std = variance.sqrt();

    // Scores live in [0,1]; std maxes out at 0.5.
    (std / 0.5).clamp(0.0, 1.0)
}

/// Very short queries retrieve poorly; saturate around a dozen words.
fn query_length_signal(query: &str) -> f32 {
    let words = query.split_whitespace().count();
    (words as f32 / 12.0).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{ChunkRecord, ScoredChunk};
    use crate::services::hybrid_search::RankedChunk;

    fn chunk(id: Uuid) -> ChunkRecord {
        ChunkRecord {
            id,
            document_id: Uuid::new_v4(),
            session_id: Uuid::nil(),
            file_name: "f".into(),
            chunk_index: 0,
            content: "c".into(),
            context_prefix: None,
            enriched_content: "c".into(),
            title_embedding: Vec::new(),
            content_embedding: Vec::new(),
            token_count: 1,
            document_title: "d".into(),
            section_title: String::new(),
            section_breadcrumb: Vec::new(),
            keywords: Vec::new(),
            associated_image_ids: Vec::new(),
        }
    }

    fn outcome(
        shared_top: bool,
        rerank_scores: &[f32],
        query: &str,
    ) -> SearchOutcome {
        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        let vector_ids = ids.clone();
        let bm25_ids: Vec<Uuid> = if shared_top {
            ids.clone()
        } else {
            (0..5).map(|_| Uuid::new_v4()).collect()
        };

        SearchOutcome {
            query: query.to_string(),
            vector_hits: vector_ids
                .iter()
                .map(|&id| ScoredChunk {
                    chunk: chunk(id),
                    score: 0.5,
                })
                .collect(),
            bm25_hits: bm25_ids
                .iter()
                .map(|&id| ScoredChunk {
                    chunk: chunk(id),
                    score: 0.5,
                })
                .collect(),
            final_hits: rerank_scores
                .iter()
                .enumerate()
                .map(|(i, &s)| RankedChunk {
                    chunk: chunk(*ids.get(i).unwrap_or(&Uuid::new_v4())),
                    rrf_score: 0.01,
                    rerank_score: Some(s),
                })
                .collect(),
        }
    }

    #[test]
    fn empty_results_are_low() {
        let out = SearchOutcome::empty("anything at all");
        let confidence = ConfidenceScorer::score(&out);
        assert_eq!(confidence.level, ConfidenceLevel::Low);
        assert_eq!(confidence.score, 0.0);
    }

    #[test]
    fn agreeing_rankers_with_strong_scores_are_high() {
        let out = outcome(
            true,
            &[0.95, 0.2, 0.15, 0.1, 0.1],
            "what is the retention policy for archived invoices",
        );
        let confidence = ConfidenceScorer::score(&out);
        assert_eq!(confidence.level, ConfidenceLevel::High);
        assert!(confidence.reason.contains("agreement=1.00"));
    }

    #[test]
    fn disjoint_rankers_weak_scores_are_low() {
        let out = outcome(false, &[0.1, 0.1, 0.1], "hm");
        let confidence = ConfidenceScorer::score(&out);
        assert_eq!(confidence.level, ConfidenceLevel::Low);
    }

    #[test]
    fn uniform_scores_have_zero_dispersion() {
        let out = outcome(true, &[0.5, 0.5, 0.5], "some medium question here");
        assert_eq!(score_dispersion(&out), 0.0);
    }

    #[test]
    fn score_is_bounded() {
        let out = outcome(
            true,
            &[1.0, 0.0, 1.0, 0.0],
            "a very long query with many words that keeps going and going on",
        );
        let confidence = ConfidenceScorer::score(&out);
        assert!((0.0..=1.0).contains(&confidence.score));
    }
}
