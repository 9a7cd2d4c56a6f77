//! Recovery decisions for interrupted scans
//!
//! Coverage of a wallet is the union of the incomplete journal's scanned
//! chunks and every chunk other sessions of the wallet (including a vault
//! restore) already scanned with the same chunk size.

use crate::error::Result;
use scan_core::{chunk_count, contiguous_frontier, detect_gaps, ScanJournalEntry};
use scan_storage_sqlite::ScanJournal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Default hole count above which a full rescan is preferred
pub const DEFAULT_MAX_GAP_CHUNKS: usize = 1_000;

/// Default hole fraction above which a full rescan is preferred
pub const DEFAULT_MAX_GAP_FRACTION: f64 = 0.25;

/// Gap-fill vs full-rescan policy
///
/// Only holes count against the thresholds: missing chunks below the
/// highest covered chunk, plus chunks left in progress. The untouched tail
/// of an interrupted scan is ordinary remaining work.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Maximum holes to fill before preferring a full rescan
    pub max_gap_chunks: usize,
    /// Maximum holes as a fraction of expected chunks
    pub max_gap_fraction: f64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_gap_chunks: DEFAULT_MAX_GAP_CHUNKS,
            max_gap_fraction: DEFAULT_MAX_GAP_FRACTION,
        }
    }
}

/// What a new session should do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryAction {
    /// Nothing to repair
    Continue,
    /// Rescan `chunks_to_rescan` under the existing journal
    ResumeFillGaps,
    /// Start over
    FullRescan,
}

impl RecoveryAction {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::ResumeFillGaps => "resume-fill-gaps",
            Self::FullRescan => "full-rescan",
        }
    }
}

/// Whether the last session was cut off mid-chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptionStatus {
    /// An incomplete journal has chunks still in progress
    pub interrupted: bool,
    /// Incomplete journal, if any
    pub scan_id: Option<String>,
    /// Its in-progress chunks
    pub in_progress_chunks: Vec<u64>,
}

/// Verdict of [`RecoveryValidator::is_recovery_safe`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryAssessment {
    /// Existing state can be trusted
    pub safe: bool,
    /// Recommended action
    pub action: RecoveryAction,
    /// Why a full rescan is recommended
    pub reason: Option<String>,
    /// Chunks to rescan, ascending
    pub chunks_to_rescan: Vec<u64>,
    /// Incomplete journal the verdict is about
    pub scan_id: Option<String>,
}

impl RecoveryAssessment {
    fn continue_with(scan_id: Option<String>) -> Self {
        Self {
            safe: true,
            action: RecoveryAction::Continue,
            reason: None,
            chunks_to_rescan: Vec::new(),
            scan_id,
        }
    }

    fn full_rescan(safe: bool, reason: String, scan_id: Option<String>) -> Self {
        Self {
            safe,
            action: RecoveryAction::FullRescan,
            reason: Some(reason),
            chunks_to_rescan: Vec::new(),
            scan_id,
        }
    }
}

/// Result of [`RecoveryValidator::validate_and_resume`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePlan {
    /// Previous progress can be reused
    pub can_resume: bool,
    /// The range must be scanned from scratch
    pub needs_full_rescan: bool,
    /// Height everything below which is known scanned
    pub last_completed_height: u64,
    /// Chunks at or beyond that height still missing
    pub gaps: Vec<u64>,
    /// Incomplete journal to resume
    pub scan_id: Option<String>,
}

/// Recovery validator
pub struct RecoveryValidator {
    journal: ScanJournal,
    config: RecoveryConfig,
}

impl RecoveryValidator {
    /// Create a validator over a journal
    pub fn new(journal: ScanJournal, config: RecoveryConfig) -> Self {
        Self { journal, config }
    }

    /// Policy in use
    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Check whether the wallet's last session stopped with chunks in flight
    pub async fn was_interrupted(&self, wallet_address: &str) -> Result<InterruptionStatus> {
        let status = match self.journal.get_incomplete_journal(wallet_address).await? {
            Some(entry) => InterruptionStatus {
                interrupted: !entry.in_progress_chunks.is_empty(),
                in_progress_chunks: entry.in_progress_chunks.iter().copied().collect(),
                scan_id: Some(entry.scan_id),
            },
            None => InterruptionStatus {
                interrupted: false,
                scan_id: None,
                in_progress_chunks: Vec::new(),
            },
        };
        Ok(status)
    }

    async fn coverage(&self, entry: &ScanJournalEntry) -> Result<BTreeSet<u64>> {
        let mut coverage = self
            .journal
            .covered_chunks(&entry.wallet_address, entry.chunk_size)
            .await?;
        coverage.extend(entry.scanned_chunks.iter().copied());
        Ok(coverage)
    }

    /// Decide how a session over `[.., end_height)` should treat existing state
    pub async fn is_recovery_safe(
        &self,
        wallet_address: &str,
        end_height: u64,
        chunk_size: u64,
    ) -> Result<RecoveryAssessment> {
        let Some(entry) = self.journal.get_incomplete_journal(wallet_address).await? else {
            return Ok(RecoveryAssessment::continue_with(None));
        };
        let scan_id = Some(entry.scan_id.clone());

        if entry.chunk_size != chunk_size {
            tracing::warn!(
                "Journal {} uses chunk size {}, requested {}",
                entry.scan_id,
                entry.chunk_size,
                chunk_size
            );
            return Ok(RecoveryAssessment::full_rescan(
                false,
                format!(
                    "chunk size changed from {} to {}",
                    entry.chunk_size, chunk_size
                ),
                scan_id,
            ));
        }

        let start = entry.start_height;
        let end = entry.target_end_height.max(end_height);
        let coverage = self.coverage(&entry).await?;
        let frontier = contiguous_frontier(&coverage, start, end, chunk_size)?;
        let aligned_start = scan_core::align_down(start, chunk_size)?;

        // Checkpoints anchored before this journal existed are not held to its frontier
        if let Some(checkpoint) = self.journal.get_checkpoint(wallet_address).await? {
            let anchor = scan_core::align_down(checkpoint.height_at_checkpoint, chunk_size)?;
            let anchored_during_session = checkpoint.timestamp > entry.created_at;
            if anchored_during_session
                && anchor >= aligned_start
                && anchor < entry.target_end_height
                && anchor > frontier
            {
                tracing::warn!(
                    "Checkpoint for {} at {} is beyond journal {} frontier {}",
                    wallet_address,
                    anchor,
                    entry.scan_id,
                    frontier
                );
                return Ok(RecoveryAssessment::full_rescan(
                    false,
                    format!(
                        "checkpoint height {} beyond contiguous frontier {}",
                        anchor, frontier
                    ),
                    scan_id,
                ));
            }
        }

        let gaps = detect_gaps(&coverage, start, end, chunk_size)?;
        let highest_covered = coverage.range(aligned_start..end).next_back().copied();

        let mut holes: BTreeSet<u64> = match highest_covered {
            Some(highest) => gaps.iter().copied().filter(|g| *g < highest).collect(),
            None => BTreeSet::new(),
        };
        holes.extend(
            entry
                .in_progress_chunks
                .iter()
                .copied()
                .filter(|c| !coverage.contains(c)),
        );

        let mut to_rescan: BTreeSet<u64> = gaps.into_iter().collect();
        to_rescan.extend(holes.iter().copied());

        if to_rescan.is_empty() {
            return Ok(RecoveryAssessment::continue_with(scan_id));
        }

        let expected = chunk_count(start, end, chunk_size)?.max(1);
        let fraction = holes.len() as f64 / expected as f64;
        if holes.len() > self.config.max_gap_chunks || fraction > self.config.max_gap_fraction {
            tracing::info!(
                "Journal {} too fragmented ({} holes, {:.1}%), preferring full rescan",
                entry.scan_id,
                holes.len(),
                fraction * 100.0
            );
            return Ok(RecoveryAssessment::full_rescan(
                true,
                format!(
                    "{} holes out of {} chunks exceeds gap-fill threshold",
                    holes.len(),
                    expected
                ),
                scan_id,
            ));
        }

        Ok(RecoveryAssessment {
            safe: true,
            action: RecoveryAction::ResumeFillGaps,
            reason: None,
            chunks_to_rescan: to_rescan.into_iter().collect(),
            scan_id,
        })
    }

    /// Work out where a session up to `target_end_height` can pick up
    pub async fn validate_and_resume(
        &self,
        wallet_address: &str,
        target_end_height: u64,
        chunk_size: u64,
    ) -> Result<ResumePlan> {
        let journals = self.journal.list_journals(wallet_address).await?;
        let checkpoint = self.journal.get_checkpoint(wallet_address).await?;

        let from_scratch = ResumePlan {
            can_resume: false,
            needs_full_rescan: true,
            last_completed_height: 0,
            gaps: Vec::new(),
            scan_id: None,
        };

        if journals.is_empty() && checkpoint.is_none() {
            return Ok(from_scratch);
        }

        if let Some(entry) = journals.iter().find(|j| j.is_incomplete()) {
            // list_journals is newest first; the active one is the latest updated
            let entry = match self.journal.get_incomplete_journal(wallet_address).await? {
                Some(active) => active,
                None => entry.clone(),
            };

            let assessment = self
                .is_recovery_safe(wallet_address, target_end_height, chunk_size)
                .await?;

            let end = entry.target_end_height.max(target_end_height);
            let frontier = if entry.chunk_size == chunk_size {
                let coverage = self.coverage(&entry).await?;
                contiguous_frontier(&coverage, entry.start_height, end, chunk_size)?
            } else {
                0
            };

            if assessment.action == RecoveryAction::FullRescan {
                return Ok(ResumePlan {
                    last_completed_height: if assessment.safe { frontier } else { 0 },
                    scan_id: Some(entry.scan_id),
                    ..from_scratch
                });
            }

            return Ok(ResumePlan {
                can_resume: true,
                needs_full_rescan: false,
                last_completed_height: frontier,
                gaps: assessment
                    .chunks_to_rescan
                    .into_iter()
                    .filter(|c| *c >= frontier)
                    .collect(),
                scan_id: Some(entry.scan_id),
            });
        }

        match checkpoint {
            Some(checkpoint) => Ok(ResumePlan {
                can_resume: true,
                needs_full_rescan: false,
                last_completed_height: checkpoint.last_completed_height.min(target_end_height),
                gaps: Vec::new(),
                scan_id: None,
            }),
            None => Ok(from_scratch),
        }
    }
}
