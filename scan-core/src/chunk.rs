//! Fixed-size height chunks
//!
//! A chunk is identified by its start height, which is always a multiple of
//! the session chunk size. Ranges are right-open: a chunk belongs to
//! `[start, end)` only if its start is strictly below `end`.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::iter::StepBy;
use std::ops::Range;

/// Default chunk size in blocks
pub const DEFAULT_CHUNK_SIZE: u64 = 1_000;

/// Height range covered by one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkRange {
    /// First height of the chunk (aligned)
    pub start: u64,
    /// One past the last height of the chunk
    pub end: u64,
}

impl ChunkRange {
    /// Chunk that contains `height`
    pub fn containing(height: u64, chunk_size: u64) -> Result<Self> {
        let start = align_down(height, chunk_size)?;
        Ok(Self {
            start,
            end: start.saturating_add(chunk_size),
        })
    }

    /// Number of heights in the chunk
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Always false for a valid chunk
    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    /// Check whether the chunk covers `height`
    pub fn contains(&self, height: u64) -> bool {
        height >= self.start && height < self.end
    }
}

fn check_size(chunk_size: u64) -> Result<()> {
    if chunk_size == 0 {
        return Err(Error::InvalidChunkSize(chunk_size));
    }
    Ok(())
}

/// Align `height` down to the nearest multiple of `chunk_size`
pub fn align_down(height: u64, chunk_size: u64) -> Result<u64> {
    check_size(chunk_size)?;
    Ok(height - height % chunk_size)
}

/// Check whether `height` is a chunk boundary
pub fn is_aligned(height: u64, chunk_size: u64) -> bool {
    chunk_size != 0 && height % chunk_size == 0
}

/// Reject chunk starts that are not multiples of `chunk_size`
pub fn ensure_aligned(chunk_starts: &[u64], chunk_size: u64) -> Result<()> {
    check_size(chunk_size)?;
    match chunk_starts.iter().find(|&&c| c % chunk_size != 0) {
        Some(&start) => Err(Error::Misaligned { start, chunk_size }),
        None => Ok(()),
    }
}

/// Expected chunk starts in `[align_down(start), end)`, ascending
pub fn chunk_starts(start: u64, end: u64, chunk_size: u64) -> Result<StepBy<Range<u64>>> {
    let aligned = align_down(start, chunk_size)?;
    let step = usize::try_from(chunk_size).map_err(|_| Error::InvalidChunkSize(chunk_size))?;
    // An inverted range yields nothing rather than an error, like an empty scan.
    Ok((aligned..end.max(aligned)).step_by(step))
}

/// Number of chunk starts `chunk_starts` would yield
pub fn chunk_count(start: u64, end: u64, chunk_size: u64) -> Result<u64> {
    let aligned = align_down(start, chunk_size)?;
    if end <= aligned {
        return Ok(0);
    }
    Ok((end - aligned).div_ceil(chunk_size))
}

/// Chunk starts whose whole range lies below `height`
pub fn covered_chunk_starts(height: u64, chunk_size: u64) -> Result<StepBy<Range<u64>>> {
    let covered_end = align_down(height, chunk_size)?;
    chunk_starts(0, covered_end, chunk_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_down() {
        assert_eq!(align_down(0, 1000).unwrap(), 0);
        assert_eq!(align_down(999, 1000).unwrap(), 0);
        assert_eq!(align_down(1000, 1000).unwrap(), 1000);
        assert_eq!(align_down(3_800_123, 1000).unwrap(), 3_800_000);
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        assert_eq!(align_down(10, 0), Err(Error::InvalidChunkSize(0)));
        assert!(chunk_starts(0, 10, 0).is_err());
        assert!(!is_aligned(0, 0));
    }

    #[test]
    fn test_chunk_starts_right_open() {
        let starts: Vec<u64> = chunk_starts(0, 5000, 1000).unwrap().collect();
        assert_eq!(starts, vec![0, 1000, 2000, 3000, 4000]);

        // 5000 starts at the end height, so it is excluded
        let starts: Vec<u64> = chunk_starts(1500, 5001, 1000).unwrap().collect();
        assert_eq!(starts, vec![1000, 2000, 3000, 4000, 5000]);
    }

    #[test]
    fn test_chunk_count_matches_iterator() {
        for (start, end) in [(0, 0), (0, 1), (0, 5000), (1500, 5001), (7000, 3000)] {
            let count = chunk_count(start, end, 1000).unwrap();
            let iterated = chunk_starts(start, end, 1000).unwrap().count() as u64;
            assert_eq!(count, iterated, "range {}..{}", start, end);
        }
    }

    #[test]
    fn test_ensure_aligned() {
        assert!(ensure_aligned(&[0, 1000, 2000], 1000).is_ok());
        assert_eq!(
            ensure_aligned(&[0, 1500], 1000),
            Err(Error::Misaligned {
                start: 1500,
                chunk_size: 1000
            })
        );
    }

    #[test]
    fn test_covered_chunk_starts() {
        let covered: Vec<u64> = covered_chunk_starts(3500, 1000).unwrap().collect();
        assert_eq!(covered, vec![0, 1000, 2000]);
        assert_eq!(covered_chunk_starts(999, 1000).unwrap().count(), 0);
    }

    #[test]
    fn test_chunk_range() {
        let range = ChunkRange::containing(2345, 1000).unwrap();
        assert_eq!(range.start, 2000);
        assert_eq!(range.end, 3000);
        assert_eq!(range.len(), 1000);
        assert!(range.contains(2999));
        assert!(!range.contains(3000));
    }
}
