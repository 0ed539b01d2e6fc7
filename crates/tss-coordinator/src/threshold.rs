//! Byzantine threshold math and random quorum selection

use rand::seq::SliceRandom;
use rand::Rng;

/// Byzantine threshold for `n` parties
///
/// With n parties, need `(n * 2 / 3) + 1` of them (more than 2/3), never more
/// than `n` and never less than one.
///
/// 3 -> 3, 4 -> 3, 5 -> 4, 6 -> 5, 7 -> 5, 9 -> 7
pub fn threshold(n: usize) -> usize {
    if n == 0 {
        return 1;
    }
    ((n * 2) / 3 + 1).min(n)
}

/// Pick a uniformly random threshold-sized subset of `eligible`
///
/// Returns everything when the set is already no larger than its threshold,
/// and an empty vec for an empty input.
pub fn select_random_threshold<T: Clone>(eligible: &[T]) -> Vec<T> {
    select_random_threshold_with(eligible, &mut rand::thread_rng())
}

/// [`select_random_threshold`] with a caller supplied rng
pub fn select_random_threshold_with<T: Clone, R: Rng + ?Sized>(
    eligible: &[T],
    rng: &mut R,
) -> Vec<T> {
    if eligible.is_empty() {
        return Vec::new();
    }

    let needed = threshold(eligible.len());
    if eligible.len() <= needed {
        return eligible.to_vec();
    }

    let mut shuffled = eligible.to_vec();
    shuffled.shuffle(rng);
    shuffled.truncate(needed);
    shuffled
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_threshold_table() {
        let cases = [
            (0, 1),
            (1, 1),
            (2, 2),
            (3, 3),
            (4, 3),
            (5, 4),
            (6, 5),
            (7, 5),
            (8, 6),
            (9, 7),
        ];
        for (n, expected) in cases {
            assert_eq!(threshold(n), expected, "threshold({})", n);
        }
    }

    #[test]
    fn test_select_returns_threshold_subset() {
        let eligible: Vec<String> = (1..=5).map(|i| format!("v{}", i)).collect();

        let selected = select_random_threshold(&eligible);
        assert_eq!(selected.len(), 4);

        let unique: HashSet<_> = selected.iter().collect();
        assert_eq!(unique.len(), 4);
        assert!(selected.iter().all(|v| eligible.contains(v)));
    }

    #[test]
    fn test_select_returns_all_when_small() {
        let eligible = vec!["v1".to_string(), "v2".to_string()];
        assert_eq!(select_random_threshold(&eligible), eligible);
    }

    #[test]
    fn test_select_empty() {
        let eligible: Vec<String> = Vec::new();
        assert!(select_random_threshold(&eligible).is_empty());
    }

    proptest! {
        #[test]
        fn prop_threshold_is_byzantine_quorum(n in 1usize..10_000) {
            let t = threshold(n);
            prop_assert!(t <= n);
            // t > 2n/3  <=>  3t > 2n
            prop_assert!(3 * t > 2 * n);
        }

        #[test]
        fn prop_selection_size(n in 0usize..64) {
            let eligible: Vec<usize> = (0..n).collect();
            let selected = select_random_threshold(&eligible);
            prop_assert_eq!(selected.len(), n.min(threshold(n)));

            let unique: HashSet<_> = selected.iter().collect();
            prop_assert_eq!(unique.len(), selected.len());
        }
    }
}
