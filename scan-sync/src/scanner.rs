//! Scan coordinator
//!
//! Plans a session from the journal, fans the planned chunks out to the
//! batch workers and journals every result. Progress is buffered and
//! flushed every `flush_interval` chunks; the journal is completed only
//! when every planned chunk was ingested.

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::progress::{ScanProgress, ScanStage};
use crate::recovery::{RecoveryAction, RecoveryConfig, RecoveryValidator};
use crate::source::ChunkSource;
use crate::worker::WorkerHandle;
use scan_core::{align_down, detect_gaps, ScanPhase, DEFAULT_CHUNK_SIZE};
use scan_storage_sqlite::ScanJournal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Chunks ingested between journal flushes
pub const DEFAULT_FLUSH_INTERVAL: u64 = 5;

/// Scan configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Chunk size in blocks
    pub chunk_size: u64,
    /// Chunks ingested between journal flushes
    pub flush_interval: u64,
    /// Gap-fill vs full-rescan policy
    pub recovery: RecoveryConfig,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            recovery: RecoveryConfig::default(),
        }
    }
}

/// One scan session request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRequest {
    /// Wallet to scan for
    pub wallet_address: String,
    /// First height, inclusive
    pub start_height: u64,
    /// Last height, exclusive
    pub end_height: u64,
    /// Id for a new session; generated when absent
    #[serde(default)]
    pub scan_id: Option<String>,
}

/// Result of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    /// Session the results were journaled under
    pub scan_id: String,
    /// Chunks planned
    pub planned: u64,
    /// Chunks ingested
    pub completed: u64,
    /// Chunks that failed and remain gaps
    pub failed: u64,
    /// Wallet transactions found this session
    pub transactions_found: u64,
    /// Cancel token fired before all chunks ran
    pub cancelled: bool,
    /// Journal marked complete and checkpoint advanced
    pub completed_journal: bool,
    /// Wall time
    pub elapsed: Duration,
}

struct SessionPlan {
    scan_id: String,
    target_end_height: u64,
    chunks: Vec<u64>,
    resumed: bool,
}

#[derive(Default)]
struct RangeResult {
    completed: u64,
    failed: u64,
    transactions: u64,
    fatal: Option<Error>,
}

#[derive(Clone)]
struct RangeRunner {
    journal: ScanJournal,
    source: Arc<dyn ChunkSource>,
    progress: ScanProgress,
    abort: CancelToken,
    scan_id: Arc<str>,
    chunk_size: u64,
    flush_interval: u64,
}

/// Scan coordinator
pub struct ScanCoordinator {
    journal: ScanJournal,
    source: Arc<dyn ChunkSource>,
    workers: Vec<WorkerHandle>,
    config: ScanConfig,
    progress: ScanProgress,
    cancel: CancelToken,
}

impl ScanCoordinator {
    /// Create a coordinator over initialized workers
    pub fn new(
        journal: ScanJournal,
        source: Arc<dyn ChunkSource>,
        workers: Vec<WorkerHandle>,
        config: ScanConfig,
    ) -> Result<Self> {
        if workers.is_empty() {
            return Err(Error::Config("at least one worker is required".to_string()));
        }
        if config.chunk_size == 0 {
            return Err(scan_core::Error::InvalidChunkSize(0).into());
        }

        Ok(Self {
            journal,
            source,
            workers,
            config,
            progress: ScanProgress::new(),
            cancel: CancelToken::new(),
        })
    }

    /// Shared progress
    pub fn progress(&self) -> ScanProgress {
        self.progress.clone()
    }

    /// Token that stops the session between chunks
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Configuration in use
    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Run one session to completion, cancellation or a fatal error
    pub async fn run(&self, request: ScanRequest) -> Result<ScanReport> {
        if request.start_height > request.end_height {
            return Err(scan_core::Error::InvalidRange {
                start: request.start_height,
                end: request.end_height,
            }
            .into());
        }

        let started = Instant::now();
        self.progress.set_stage(ScanStage::Planning);

        let plan = self.plan(&request).await?;
        let planned = plan.chunks.len() as u64;

        tracing::info!(
            "Scan {} for {}: {} chunks planned ({})",
            plan.scan_id,
            request.wallet_address,
            planned,
            if plan.resumed { "resumed" } else { "new" }
        );

        self.progress.start(planned);
        self.progress.set_stage(if plan.resumed {
            ScanStage::GapFill
        } else {
            ScanStage::Scanning
        });

        let result = self.execute(&plan).await;

        self.progress.set_stage(ScanStage::Finalizing);
        self.journal.flush_pending_updates().await?;

        if let Some(fatal) = result.fatal {
            tracing::error!("Scan {} aborted: {}", plan.scan_id, fatal);
            return Err(fatal);
        }

        let cancelled = self.cancel.is_cancelled();
        let mut completed_journal = false;

        if result.failed == 0 && !cancelled {
            self.journal
                .complete_scan_journal(&plan.scan_id, plan.target_end_height)
                .await?;
            completed_journal = true;
            if let [worker] = self.workers.as_slice() {
                self.save_balance(worker, &request.wallet_address, plan.target_end_height)
                    .await?;
            }
            self.progress.set_stage(ScanStage::Complete);
        } else {
            tracing::info!(
                "Scan {} left incomplete: {} failed chunks, cancelled={}",
                plan.scan_id,
                result.failed,
                cancelled
            );
        }

        let report = ScanReport {
            scan_id: plan.scan_id,
            planned,
            completed: result.completed,
            failed: result.failed,
            transactions_found: result.transactions,
            cancelled,
            completed_journal,
            elapsed: started.elapsed(),
        };

        tracing::info!("{}", self.progress.summary());
        Ok(report)
    }

    async fn plan(&self, request: &ScanRequest) -> Result<SessionPlan> {
        let wallet = request.wallet_address.as_str();
        let chunk_size = self.config.chunk_size;
        let validator = RecoveryValidator::new(self.journal.clone(), self.config.recovery);
        let assessment = validator
            .is_recovery_safe(wallet, request.end_height, chunk_size)
            .await?;

        match (assessment.action, assessment.scan_id) {
            (RecoveryAction::FullRescan, scan_id) => {
                if assessment.safe {
                    // Fragmented but trustworthy: restart the same session
                    return self.fresh_session(request, scan_id).await;
                }
                tracing::warn!(
                    "Unsafe scan state for {} ({}), starting from a clean slate",
                    wallet,
                    assessment.reason.as_deref().unwrap_or("unknown")
                );
                self.journal.force_clean_slate(wallet).await?;
                self.fresh_session(request, None).await
            }
            (_, Some(scan_id)) => {
                if let Some(requested) = &request.scan_id {
                    if *requested != scan_id {
                        tracing::info!(
                            "Resuming incomplete scan {} instead of starting {}",
                            scan_id,
                            requested
                        );
                    }
                }
                let target_end_height = self
                    .journal
                    .extend_target_height(&scan_id, request.end_height)
                    .await?;
                self.journal.set_phase(&scan_id, ScanPhase::Phase2).await?;

                let mut chunks: BTreeSet<u64> = assessment.chunks_to_rescan.into_iter().collect();
                chunks.extend(self.widen_start(&scan_id, request).await?);

                Ok(SessionPlan {
                    scan_id,
                    target_end_height,
                    chunks: chunks.into_iter().collect(),
                    resumed: true,
                })
            }
            (_, None) => self.fresh_session(request, None).await,
        }
    }

    /// Uncovered chunks of a request reaching below the resumed journal's start
    ///
    /// The journal's start is lowered to the request's so completion covers
    /// the whole requested range.
    async fn widen_start(&self, scan_id: &str, request: &ScanRequest) -> Result<Vec<u64>> {
        let chunk_size = self.config.chunk_size;
        let Some(entry) = self.journal.get_journal(scan_id).await? else {
            return Ok(Vec::new());
        };
        if align_down(request.start_height, chunk_size)?
            >= align_down(entry.start_height, chunk_size)?
        {
            return Ok(Vec::new());
        }

        self.journal
            .extend_start_height(scan_id, request.start_height)
            .await?;
        let covered = self
            .journal
            .covered_chunks(&request.wallet_address, chunk_size)
            .await?;
        let below = detect_gaps(
            &covered,
            request.start_height,
            entry.start_height,
            chunk_size,
        )?;

        tracing::info!(
            "Scan {} widened from {} down to {}: {} more chunks",
            scan_id,
            entry.start_height,
            request.start_height,
            below.len()
        );
        Ok(below)
    }

    async fn fresh_session(
        &self,
        request: &ScanRequest,
        reuse_id: Option<String>,
    ) -> Result<SessionPlan> {
        let chunk_size = self.config.chunk_size;
        let scan_id = reuse_id
            .or_else(|| request.scan_id.clone())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        self.journal
            .start_scan_journal_with_chunk_size(
                &scan_id,
                &request.wallet_address,
                request.start_height,
                request.end_height,
                chunk_size,
            )
            .await?;

        // Chunks other sessions already scanned are skipped
        let covered = self
            .journal
            .covered_chunks(&request.wallet_address, chunk_size)
            .await?;
        let chunks = detect_gaps(
            &covered,
            request.start_height,
            request.end_height,
            chunk_size,
        )?;

        Ok(SessionPlan {
            scan_id,
            target_end_height: request.end_height,
            chunks,
            resumed: false,
        })
    }

    async fn execute(&self, plan: &SessionPlan) -> RangeResult {
        let mut total = RangeResult::default();
        if plan.chunks.is_empty() {
            return total;
        }

        let runner = RangeRunner {
            journal: self.journal.clone(),
            source: Arc::clone(&self.source),
            progress: self.progress.clone(),
            abort: self.cancel.child(),
            scan_id: Arc::from(plan.scan_id.as_str()),
            chunk_size: self.config.chunk_size,
            flush_interval: self.config.flush_interval.max(1),
        };

        let lanes = self.workers.len().min(plan.chunks.len());
        let per_lane = plan.chunks.len().div_ceil(lanes);

        let mut tasks = Vec::with_capacity(lanes);
        for (worker, range) in self.workers.iter().zip(plan.chunks.chunks(per_lane)) {
            let runner = runner.clone();
            let worker = worker.clone();
            let range = range.to_vec();
            tracing::debug!(
                "Worker {} takes {} chunks from {}",
                worker.name(),
                range.len(),
                range[0]
            );
            tasks.push(tokio::spawn(async move { runner.run(worker, range).await }));
        }

        for task in tasks {
            let result = match task.await {
                Ok(result) => result,
                Err(e) => RangeResult {
                    fatal: Some(Error::Protocol(format!("scan task failed: {}", e))),
                    ..Default::default()
                },
            };
            total.completed += result.completed;
            total.failed += result.failed;
            total.transactions += result.transactions;
            if total.fatal.is_none() {
                total.fatal = result.fatal;
            }
        }

        total
    }

    async fn save_balance(&self, worker: &WorkerHandle, wallet: &str, height: u64) -> Result<()> {
        match worker.get_balance().await {
            Ok(balance) => {
                self.journal
                    .save_balance_checkpoint(wallet, balance, height)
                    .await?
            }
            Err(e) => tracing::warn!("No balance checkpoint for {}: {}", wallet, e),
        }
        Ok(())
    }
}

impl RangeRunner {
    async fn run(self, worker: WorkerHandle, chunks: Vec<u64>) -> RangeResult {
        let mut result = RangeResult::default();
        let mut since_flush = 0u64;

        for chunk_start in chunks {
            if self.abort.is_cancelled() {
                break;
            }

            match self.scan_chunk(&worker, chunk_start).await {
                Ok(transactions) => {
                    result.completed += 1;
                    result.transactions += transactions;
                    since_flush += 1;
                    if since_flush >= self.flush_interval {
                        since_flush = 0;
                        if let Err(e) = self.journal.flush_pending_updates().await {
                            result.fatal = Some(e.into());
                            self.abort.cancel();
                            break;
                        }
                    }
                }
                Err(e) => {
                    result.failed += 1;
                    self.progress.record_failure();
                    tracing::warn!(
                        "Chunk {} failed on {}: {}",
                        chunk_start,
                        worker.name(),
                        e
                    );
                    if let Err(journal_err) = self
                        .journal
                        .record_scan_error(&self.scan_id, &e.to_string())
                        .await
                    {
                        tracing::error!("Could not journal chunk error: {}", journal_err);
                    }

                    if is_session_fatal(&e) {
                        self.abort.cancel();
                        result.fatal = Some(e);
                        break;
                    }
                }
            }
        }

        result
    }

    /// Scan one chunk, returning the wallet transactions it held
    async fn scan_chunk(&self, worker: &WorkerHandle, chunk_start: u64) -> Result<u64> {
        self.journal
            .mark_chunks_in_progress(&self.scan_id, &[chunk_start])
            .await?;

        let chunk = self
            .source
            .fetch_chunk(chunk_start, self.chunk_size)
            .await?;

        let outcome = worker
            .process(
                &chunk.sparse_data,
                chunk.start_height,
                chunk.batch_id,
                chunk.expected_hash,
            )
            .await?;

        if !outcome.success {
            return Err(Error::from_worker(
                outcome.error_kind,
                outcome.error.unwrap_or_default(),
            ));
        }

        self.journal
            .record_scanned_chunks(
                &self.scan_id,
                &[chunk_start],
                outcome.txs_matched > 0,
                outcome.txs_matched,
            )
            .await?;
        self.progress.record_chunk(chunk_start, outcome.txs_matched);

        Ok(outcome.txs_matched)
    }
}

fn is_session_fatal(e: &Error) -> bool {
    matches!(e, Error::Storage(_) | Error::WorkerClosed) || e.kind().is_fatal()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_from_partial_json() {
        let config: ScanConfig = serde_json::from_str(r#"{"chunk_size": 500}"#).unwrap();
        assert_eq!(config.chunk_size, 500);
        assert_eq!(config.flush_interval, DEFAULT_FLUSH_INTERVAL);
        assert_eq!(config.recovery, RecoveryConfig::default());
    }

    #[test]
    fn test_session_fatal_errors() {
        assert!(is_session_fatal(&Error::Integrity("x".into())));
        assert!(is_session_fatal(&Error::EngineFailed("x".into())));
        assert!(is_session_fatal(&Error::WorkerClosed));
        assert!(!is_session_fatal(&Error::EngineIngestion("x".into())));
        assert!(!is_session_fatal(&Error::Source("x".into())));
    }
}
