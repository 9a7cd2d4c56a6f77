//! Scan journal data model

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Current time as unix milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Phase of a scan session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanPhase {
    /// Initial pass over the range
    Phase1,
    /// Gap-fill pass
    Phase2,
    /// Terminal
    Complete,
}

impl ScanPhase {
    /// Stored representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Phase1 => "phase1",
            Self::Phase2 => "phase2",
            Self::Complete => "complete",
        }
    }

    /// Check if the session is finished
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

impl fmt::Display for ScanPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanPhase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "phase1" => Ok(Self::Phase1),
            "phase2" => Ok(Self::Phase2),
            "complete" => Ok(Self::Complete),
            other => Err(Error::InvalidPhase(other.to_string())),
        }
    }
}

/// Per-session record of chunk progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanJournalEntry {
    /// Session id
    pub scan_id: String,
    /// Wallet the session scans for
    pub wallet_address: String,
    /// First height requested
    pub start_height: u64,
    /// Height the session scans up to (exclusive)
    pub target_end_height: u64,
    /// Chunk size, fixed for the session
    pub chunk_size: u64,
    /// Chunks fully ingested
    pub scanned_chunks: BTreeSet<u64>,
    /// Chunks handed to a worker and not yet reconciled
    pub in_progress_chunks: BTreeSet<u64>,
    /// Scanned chunks that contained wallet transactions
    pub matched_chunks: BTreeSet<u64>,
    /// Session phase
    pub phase: ScanPhase,
    /// Wallet transactions found so far
    pub transactions_found: u64,
    /// Errors recorded so far
    pub error_count: u64,
    /// Most recent error
    pub last_error_message: Option<String>,
    /// Last mutation (unix millis)
    pub last_update_timestamp: i64,
    /// Creation time (unix millis)
    pub created_at: i64,
}

impl ScanJournalEntry {
    /// Fresh entry in phase 1 with empty chunk sets
    pub fn new(
        scan_id: impl Into<String>,
        wallet_address: impl Into<String>,
        start_height: u64,
        target_end_height: u64,
        chunk_size: u64,
    ) -> Self {
        let now = now_millis();
        Self {
            scan_id: scan_id.into(),
            wallet_address: wallet_address.into(),
            start_height,
            target_end_height,
            chunk_size,
            scanned_chunks: BTreeSet::new(),
            in_progress_chunks: BTreeSet::new(),
            matched_chunks: BTreeSet::new(),
            phase: ScanPhase::Phase1,
            transactions_found: 0,
            error_count: 0,
            last_error_message: None,
            last_update_timestamp: now,
            created_at: now,
        }
    }

    /// Check if the session is still active
    pub fn is_incomplete(&self) -> bool {
        !self.phase.is_complete()
    }

    /// Check the at-rest invariants of the chunk sets
    pub fn is_consistent(&self) -> bool {
        self.scanned_chunks.is_disjoint(&self.in_progress_chunks)
            && self.matched_chunks.is_subset(&self.scanned_chunks)
            && self
                .scanned_chunks
                .iter()
                .chain(self.in_progress_chunks.iter())
                .all(|c| crate::is_aligned(*c, self.chunk_size))
    }
}

/// Per-wallet anchor of the last verified balance and height
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCheckpoint {
    /// Wallet the checkpoint belongs to
    pub wallet_address: String,
    /// Highest height a completed scan reached
    pub last_completed_height: u64,
    /// Balance verified at `height_at_checkpoint`
    pub balance_at_checkpoint: i64,
    /// Height of the balance anchor
    pub height_at_checkpoint: u64,
    /// Last update (unix millis)
    pub timestamp: i64,
}

/// Last batch a worker ingested successfully (worker lifetime only)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerBatchMarker {
    /// Batch id supplied by the caller
    pub id: Option<String>,
    /// Start height of the batch
    pub height: u64,
    /// When the batch finished (unix millis), 0 if none yet
    pub timestamp: i64,
}

impl WorkerBatchMarker {
    /// Marker for a batch that just succeeded
    pub fn succeeded(id: Option<String>, height: u64) -> Self {
        Self {
            id,
            height,
            timestamp: now_millis(),
        }
    }

    /// Check if any batch has succeeded yet
    pub fn is_set(&self) -> bool {
        self.timestamp != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_roundtrip_names() {
        for phase in [ScanPhase::Phase1, ScanPhase::Phase2, ScanPhase::Complete] {
            assert_eq!(phase.as_str().parse::<ScanPhase>().unwrap(), phase);
        }
        assert!("phase3".parse::<ScanPhase>().is_err());
    }

    #[test]
    fn test_phase_serde_matches_storage_name() {
        let json = serde_json::to_string(&ScanPhase::Phase2).unwrap();
        assert_eq!(json, "\"phase2\"");
    }

    #[test]
    fn test_new_entry_is_consistent() {
        let entry = ScanJournalEntry::new("s1", "w1", 0, 10_000, 1000);
        assert_eq!(entry.phase, ScanPhase::Phase1);
        assert!(entry.is_incomplete());
        assert!(entry.is_consistent());
    }

    #[test]
    fn test_inconsistent_entry_detected() {
        let mut entry = ScanJournalEntry::new("s1", "w1", 0, 10_000, 1000);
        entry.matched_chunks.insert(2000);
        assert!(!entry.is_consistent());

        entry.scanned_chunks.insert(2000);
        assert!(entry.is_consistent());

        entry.in_progress_chunks.insert(2000);
        assert!(!entry.is_consistent());
    }

    #[test]
    fn test_default_marker() {
        let marker = WorkerBatchMarker::default();
        assert_eq!(marker.id, None);
        assert_eq!(marker.height, 0);
        assert!(!marker.is_set());
        assert!(WorkerBatchMarker::succeeded(Some("b1".into()), 1000).is_set());
    }
}
