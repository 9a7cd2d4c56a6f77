//! Scan progress tracking with ETA calculation

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Scan stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStage {
    /// Consulting the journal and planning chunks
    Planning,
    /// First pass over the range
    Scanning,
    /// Rescanning gaps of an interrupted session
    GapFill,
    /// Flushing and completing the journal
    Finalizing,
    /// Done
    Complete,
}

impl ScanStage {
    /// Get display name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Planning => "Planning",
            Self::Scanning => "Scanning Chunks",
            Self::GapFill => "Filling Gaps",
            Self::Finalizing => "Finalizing",
            Self::Complete => "Complete",
        }
    }
}

/// Point-in-time copy of the progress counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Current stage
    pub stage: ScanStage,
    /// Chunks planned
    pub chunks_total: u64,
    /// Chunks ingested
    pub chunks_done: u64,
    /// Chunks that failed this session
    pub chunks_failed: u64,
    /// Wallet transactions found
    pub transactions: u64,
    /// Highest chunk start ingested
    pub last_chunk: Option<u64>,
    /// Throughput
    pub chunks_per_second: f64,
    /// Estimated seconds remaining
    pub eta_seconds: Option<u64>,
}

/// Scan progress
#[derive(Debug, Clone)]
pub struct ScanProgress {
    inner: Arc<RwLock<ProgressInner>>,
}

#[derive(Debug, Clone)]
struct ProgressInner {
    stage: ScanStage,
    chunks_total: u64,
    chunks_done: u64,
    chunks_failed: u64,
    transactions: u64,
    last_chunk: Option<u64>,
    start_time: Option<Instant>,
    chunks_per_second: f64,
    eta_seconds: Option<u64>,
}

impl ScanProgress {
    /// Create new progress tracker
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(ProgressInner {
                stage: ScanStage::Planning,
                chunks_total: 0,
                chunks_done: 0,
                chunks_failed: 0,
                transactions: 0,
                last_chunk: None,
                start_time: None,
                chunks_per_second: 0.0,
                eta_seconds: None,
            })),
        }
    }

    /// Start tracking a session of `chunks_total` chunks
    pub fn start(&self, chunks_total: u64) {
        let mut inner = self.inner.write();
        inner.start_time = Some(Instant::now());
        inner.chunks_total = chunks_total;
        inner.chunks_done = 0;
        inner.chunks_failed = 0;
        inner.transactions = 0;
        inner.last_chunk = None;
        inner.chunks_per_second = 0.0;
        inner.eta_seconds = None;
    }

    /// Set stage
    pub fn set_stage(&self, stage: ScanStage) {
        self.inner.write().stage = stage;
    }

    /// Record an ingested chunk
    pub fn record_chunk(&self, chunk_start: u64, transactions: u64) {
        let mut inner = self.inner.write();
        inner.chunks_done += 1;
        inner.transactions += transactions;
        inner.last_chunk = Some(inner.last_chunk.map_or(chunk_start, |c| c.max(chunk_start)));

        if let Some(start_time) = inner.start_time {
            let elapsed = start_time.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                inner.chunks_per_second = inner.chunks_done as f64 / elapsed;
                let remaining = inner
                    .chunks_total
                    .saturating_sub(inner.chunks_done + inner.chunks_failed);
                if inner.chunks_per_second > 0.0 {
                    inner.eta_seconds = Some((remaining as f64 / inner.chunks_per_second) as u64);
                }
            }
        }
    }

    /// Record a chunk that failed this session
    pub fn record_failure(&self) {
        self.inner.write().chunks_failed += 1;
    }

    /// Get progress percentage
    pub fn percentage(&self) -> f64 {
        let inner = self.inner.read();
        if inner.chunks_total == 0 {
            return if inner.stage == ScanStage::Complete {
                100.0
            } else {
                0.0
            };
        }
        let handled = (inner.chunks_done + inner.chunks_failed).min(inner.chunks_total);
        (handled as f64 / inner.chunks_total as f64) * 100.0
    }

    /// Get current stage
    pub fn stage(&self) -> ScanStage {
        self.inner.read().stage
    }

    /// Check if the session finished
    pub fn is_complete(&self) -> bool {
        self.stage() == ScanStage::Complete
    }

    /// Chunks ingested
    pub fn chunks_done(&self) -> u64 {
        self.inner.read().chunks_done
    }

    /// Chunks failed
    pub fn chunks_failed(&self) -> u64 {
        self.inner.read().chunks_failed
    }

    /// Get ETA in seconds
    pub fn eta_seconds(&self) -> Option<u64> {
        self.inner.read().eta_seconds
    }

    /// Get elapsed time
    pub fn elapsed(&self) -> Option<Duration> {
        self.inner.read().start_time.map(|start| start.elapsed())
    }

    /// Copy the counters
    pub fn snapshot(&self) -> ProgressSnapshot {
        let inner = self.inner.read();
        ProgressSnapshot {
            stage: inner.stage,
            chunks_total: inner.chunks_total,
            chunks_done: inner.chunks_done,
            chunks_failed: inner.chunks_failed,
            transactions: inner.transactions,
            last_chunk: inner.last_chunk,
            chunks_per_second: inner.chunks_per_second,
            eta_seconds: inner.eta_seconds,
        }
    }

    /// Format progress summary
    pub fn summary(&self) -> String {
        let snapshot = self.snapshot();
        let eta = snapshot
            .eta_seconds
            .map(format_eta)
            .unwrap_or_else(|| "calculating...".to_string());

        format!(
            "{} - {}/{} chunks ({:.1}%), {} failed, {} txs, {:.1} chunks/s, ETA: {}",
            snapshot.stage.name(),
            snapshot.chunks_done,
            snapshot.chunks_total,
            self.percentage(),
            snapshot.chunks_failed,
            snapshot.transactions,
            snapshot.chunks_per_second,
            eta
        )
    }
}

impl Default for ScanProgress {
    fn default() -> Self {
        Self::new()
    }
}

fn format_eta(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage() {
        let progress = ScanProgress::new();
        assert_eq!(progress.percentage(), 0.0);

        progress.start(4);
        progress.record_chunk(0, 1);
        progress.record_failure();
        assert_eq!(progress.percentage(), 50.0);

        let snapshot = progress.snapshot();
        assert_eq!(snapshot.chunks_done, 1);
        assert_eq!(snapshot.chunks_failed, 1);
        assert_eq!(snapshot.transactions, 1);
        assert_eq!(snapshot.last_chunk, Some(0));
    }

    #[test]
    fn test_empty_session_complete() {
        let progress = ScanProgress::new();
        progress.start(0);
        progress.set_stage(ScanStage::Complete);
        assert_eq!(progress.percentage(), 100.0);
        assert!(progress.is_complete());
    }

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(30), "30s");
        assert_eq!(format_eta(90), "1m 30s");
        assert_eq!(format_eta(3700), "1h 1m");
    }

    #[test]
    fn test_summary_mentions_stage() {
        let progress = ScanProgress::new();
        progress.set_stage(ScanStage::GapFill);
        assert!(progress.summary().starts_with("Filling Gaps"));
    }
}
