//! Reciprocal Rank Fusion.
//!
//! Combines multiple ranked lists into a single fused ranking:
//! `score(d) = Σ_r 1 / (k + rank_r(d))`, ranks 1-indexed. Used to fuse the
//! lexical and vector candidate lists when the engine-side hybrid query is
//! unavailable, and to blend memory retrieval signals.

use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct RrfConfig {
    /// Higher k flattens the contribution of lower-ranked items. 60 is the
    /// value recommended in the original paper.
    pub k: u32,
}

impl Default for RrfConfig {
    fn default() -> Self {
        Self { k: 60 }
    }
}

impl RrfConfig {
    pub const fn new(k: u32) -> Self {
        Self { k }
    }
}

/// Fuse ranked id lists (most relevant first) into `(id, score)` pairs
/// sorted by fused score descending. Ties break toward the id's earliest
/// appearance so the output is deterministic.
pub fn reciprocal_rank_fusion(ranked_lists: &[&[Uuid]], config: RrfConfig) -> Vec<(Uuid, f64)> {
    let mut scores: HashMap<Uuid, f64> = HashMap::new();
    let mut first_seen: HashMap<Uuid, usize> = HashMap::new();
    let mut order = 0usize;

    for list in ranked_lists {
        for (rank, &id) in list.iter().enumerate() {
            let rrf_score = 1.0 / f64::from(config.k + rank as u32 + 1);
            *scores.entry(id).or_insert(0.0) += rrf_score;
            first_seen.entry(id).or_insert_with(|| {
                order += 1;
                order
            });
        }
    }

    let mut results: Vec<(Uuid, f64)> = scores.into_iter().collect();
    results.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| first_seen[&a.0].cmp(&first_seen[&b.0]))
    });

    results
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    #[test]
    fn single_list_preserves_order() {
        let list = ids(3);
        let fused = reciprocal_rank_fusion(&[&list], RrfConfig::default());
        assert_eq!(fused.len(), 3);
        assert_eq!(fused[0].0, list[0]);
        assert!(fused[0].1 > fused[1].1);
        assert!(fused[1].1 > fused[2].1);
    }

    #[test]
    fn top_of_both_lists_wins() {
        // Item ranked 1st by both retrievers must be 1st after fusion.
        let shared = Uuid::new_v4();
        let rest = ids(3);
        let list1 = vec![shared, rest[0], rest[1]];
        let list2 = vec![shared, rest[2], rest[0]];
        let fused = reciprocal_rank_fusion(&[&list1, &list2], RrfConfig::default());
        assert_eq!(fused[0].0, shared);
    }

    #[test]
    fn disjoint_lists_tie_at_same_rank() {
        let a = ids(2);
        let b = ids(2);
        let fused = reciprocal_rank_fusion(&[&a, &b], RrfConfig::default());
        assert_eq!(fused.len(), 4);
        let score_a0 = fused.iter().find(|(id, _)| *id == a[0]).unwrap().1;
        let score_b0 = fused.iter().find(|(id, _)| *id == b[0]).unwrap().1;
        assert!((score_a0 - score_b0).abs() < f64::EPSILON);
    }

    #[test]
    fn score_formula() {
        let id = Uuid::new_v4();
        let list1 = vec![id];
        let list2 = vec![id];
        let fused = reciprocal_rank_fusion(&[&list1, &list2], RrfConfig::new(60));
        assert!((fused[0].1 - 2.0 / 61.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_input() {
        let empty: Vec<Uuid> = vec![];
        let fused = reciprocal_rank_fusion(&[&empty], RrfConfig::default());
        assert!(fused.is_empty());
    }
}
