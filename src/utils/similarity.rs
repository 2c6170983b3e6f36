use std::collections::HashSet;

/// Jaccard overlap of two id sets, 0.0 when both are empty. Feeds the
/// ranker-agreement signal in confidence scoring.
pub fn jaccard<T: std::hash::Hash + Eq>(a: &HashSet<T>, b: &HashSet<T>) -> f32 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    let inter = a.intersection(b).count();
    inter as f32 / union as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jaccard_overlap() {
        let a: HashSet<i32> = [1, 2, 3].into_iter().collect();
        let b: HashSet<i32> = [2, 3, 4].into_iter().collect();
        assert!((jaccard(&a, &b) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn disjoint_sets_have_zero_overlap() {
        let a: HashSet<i32> = [1, 2].into_iter().collect();
        let b: HashSet<i32> = [3, 4].into_iter().collect();
        assert_eq!(jaccard(&a, &b), 0.0);
    }

    #[test]
    fn identical_sets_overlap_fully() {
        let a: HashSet<i32> = [1, 2, 3].into_iter().collect();
        assert!((jaccard(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn empty_sets_are_zero_not_nan() {
        let empty: HashSet<i32> = HashSet::new();
        assert_eq!(jaccard(&empty, &empty), 0.0);
    }
}
