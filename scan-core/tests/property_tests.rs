//! Property-based tests for gap detection
//!
//! Uses proptest to verify coverage invariants across randomized inputs

use proptest::prelude::*;
use scan_core::{align_down, chunk_starts, contiguous_frontier, detect_gaps};
use std::collections::BTreeSet;

// ============================================================================
// Property Test Strategies
// ============================================================================

/// Chunk sizes from tiny to realistic
fn chunk_size_strategy() -> impl Strategy<Value = u64> {
    prop_oneof![Just(1u64), Just(7u64), Just(100u64), Just(1_000u64), 1u64..=5_000]
}

/// Range with at most a few thousand chunks
fn range_strategy() -> impl Strategy<Value = (u64, u64, u64)> {
    chunk_size_strategy().prop_flat_map(|size| {
        let span = size * 2_000;
        (0u64..=span, 0u64..=span, Just(size))
            .prop_map(|(a, b, size)| (a.min(b), a.max(b), size))
    })
}

/// Scanned chunk indexes, some inside and some outside the range
fn scanned_strategy() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(0u64..2_500, 0..400)
}

// ============================================================================
// Gap Detection Properties
// ============================================================================

proptest! {
    /// Property: gaps ∪ (scanned ∩ expected) = expected, gaps ∩ scanned = ∅
    #[test]
    fn prop_gaps_partition_expected(
        (start, end, size) in range_strategy(),
        indexes in scanned_strategy(),
    ) {
        let scanned: Vec<u64> = indexes.iter().map(|i| i * size).collect();
        let gaps = detect_gaps(&scanned, start, end, size).unwrap();

        let expected: BTreeSet<u64> = chunk_starts(start, end, size).unwrap().collect();
        let scanned_set: BTreeSet<u64> = scanned.iter().copied().collect();
        let gap_set: BTreeSet<u64> = gaps.iter().copied().collect();

        prop_assert!(gap_set.is_disjoint(&scanned_set));

        let covered: BTreeSet<u64> = scanned_set.intersection(&expected).copied().collect();
        let union: BTreeSet<u64> = gap_set.union(&covered).copied().collect();
        prop_assert_eq!(union, expected);
    }

    /// Property: output is ascending and free of duplicates
    #[test]
    fn prop_gaps_sorted_unique(
        (start, end, size) in range_strategy(),
        indexes in scanned_strategy(),
    ) {
        let scanned: Vec<u64> = indexes.iter().map(|i| i * size).collect();
        let gaps = detect_gaps(&scanned, start, end, size).unwrap();
        prop_assert!(gaps.windows(2).all(|w| w[0] < w[1]));
        prop_assert!(gaps.iter().all(|g| *g >= align_down(start, size).unwrap() && *g < end));
    }

    /// Property: result does not depend on the order of scanned input
    #[test]
    fn prop_gaps_order_invariant(
        (start, end, size) in range_strategy(),
        indexes in scanned_strategy(),
    ) {
        let scanned: Vec<u64> = indexes.iter().map(|i| i * size).collect();
        let mut reversed = scanned.clone();
        reversed.reverse();
        let mut sorted = scanned.clone();
        sorted.sort_unstable();

        let a = detect_gaps(&scanned, start, end, size).unwrap();
        prop_assert_eq!(&a, &detect_gaps(&reversed, start, end, size).unwrap());
        prop_assert_eq!(&a, &detect_gaps(&sorted, start, end, size).unwrap());
    }

    /// Property: the contiguous frontier never passes the first gap
    #[test]
    fn prop_frontier_stops_at_first_gap(
        (start, end, size) in range_strategy(),
        indexes in scanned_strategy(),
    ) {
        let scanned: Vec<u64> = indexes.iter().map(|i| i * size).collect();
        let gaps = detect_gaps(&scanned, start, end, size).unwrap();
        let frontier = contiguous_frontier(&scanned, start, end, size).unwrap();

        match gaps.first() {
            Some(first_gap) => prop_assert_eq!(frontier, *first_gap),
            None => prop_assert_eq!(frontier, end.max(align_down(start, size).unwrap())),
        }
    }
}

#[test]
fn test_documented_scenario() {
    assert_eq!(
        detect_gaps(&[0, 1000, 3000, 4000], 0, 5000, 1000).unwrap(),
        vec![2000]
    );
}
