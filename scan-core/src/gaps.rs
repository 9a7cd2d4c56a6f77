//! Gap detection over chunk coverage

use crate::chunk::{align_down, chunk_starts};
use crate::Result;
use std::collections::HashSet;

/// Chunk starts in `[align_down(start_height), end_height)` missing from `scanned`.
///
/// Runs in time linear in the number of expected chunks plus the size of
/// `scanned`, and the result is ascending regardless of the order of `scanned`.
pub fn detect_gaps<'a, I>(
    scanned: I,
    start_height: u64,
    end_height: u64,
    chunk_size: u64,
) -> Result<Vec<u64>>
where
    I: IntoIterator<Item = &'a u64>,
{
    let expected = chunk_starts(start_height, end_height, chunk_size)?;
    let scanned: HashSet<u64> = scanned.into_iter().copied().collect();

    Ok(expected.filter(|start| !scanned.contains(start)).collect())
}

/// Highest height reachable from the aligned start with no missing chunk.
///
/// Returns the aligned start when the first chunk is missing; the result is
/// capped at `end_height`.
pub fn contiguous_frontier<'a, I>(
    scanned: I,
    start_height: u64,
    end_height: u64,
    chunk_size: u64,
) -> Result<u64>
where
    I: IntoIterator<Item = &'a u64>,
{
    let aligned = align_down(start_height, chunk_size)?;
    let scanned: HashSet<u64> = scanned.into_iter().copied().collect();

    let mut frontier = aligned;
    for start in chunk_starts(start_height, end_height, chunk_size)? {
        if !scanned.contains(&start) {
            break;
        }
        frontier = start.saturating_add(chunk_size);
    }

    Ok(frontier.min(end_height.max(aligned)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_gap() {
        let scanned = [0u64, 1000, 3000, 4000];
        assert_eq!(detect_gaps(&scanned, 0, 5000, 1000).unwrap(), vec![2000]);
    }

    #[test]
    fn test_empty_scanned_returns_everything() {
        let gaps = detect_gaps(&[], 0, 5000, 1000).unwrap();
        assert_eq!(gaps, vec![0, 1000, 2000, 3000, 4000]);
    }

    #[test]
    fn test_fully_covered_range() {
        let scanned = [0u64, 1000, 2000];
        assert!(detect_gaps(&scanned, 0, 3000, 1000).unwrap().is_empty());
    }

    #[test]
    fn test_unaligned_start_is_aligned_down() {
        let scanned = [2000u64];
        assert_eq!(detect_gaps(&scanned, 1500, 3500, 1000).unwrap(), vec![1000, 3000]);
    }

    #[test]
    fn test_scanned_outside_range_ignored() {
        let scanned = [9000u64, 1000];
        assert_eq!(detect_gaps(&scanned, 0, 2000, 1000).unwrap(), vec![0]);
    }

    #[test]
    fn test_input_order_irrelevant() {
        let a = [4000u64, 0, 3000, 1000];
        let b = [0u64, 1000, 3000, 4000];
        assert_eq!(
            detect_gaps(&a, 0, 5000, 1000).unwrap(),
            detect_gaps(&b, 0, 5000, 1000).unwrap()
        );
    }

    #[test]
    fn test_large_range_is_fast() {
        // 500k chunks, every other one scanned
        let scanned: Vec<u64> = (0..500_000u64).step_by(2).map(|i| i * 10).collect();
        let gaps = detect_gaps(&scanned, 0, 5_000_000, 10).unwrap();
        assert_eq!(gaps.len(), 250_000);
        assert_eq!(gaps[0], 10);
    }

    #[test]
    fn test_contiguous_frontier() {
        let scanned = [0u64, 1000, 3000, 4000];
        assert_eq!(contiguous_frontier(&scanned, 0, 5000, 1000).unwrap(), 2000);
        assert_eq!(contiguous_frontier(&[], 500, 5000, 1000).unwrap(), 0);

        let all = [0u64, 1000, 2000];
        // Last chunk ends past the target, frontier is capped
        assert_eq!(contiguous_frontier(&all, 0, 2500, 1000).unwrap(), 2500);
    }
}
