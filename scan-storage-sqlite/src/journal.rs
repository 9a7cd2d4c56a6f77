//! Scan journal service
//!
//! Durable record of chunk progress per scan session plus the per-wallet
//! checkpoint. Two write paths:
//!
//! - buffered: [`ScanJournal::record_scanned_chunks`] stages chunks in a
//!   per-scan-id dirty set that [`ScanJournal::flush_pending_updates`]
//!   persists, one transaction per scan id;
//! - immediate: in-progress/completed marks, errors, phase changes and
//!   checkpoints hit SQLite before the call returns.
//!
//! SQLite work runs on the blocking pool; every transaction is retried on
//! SQLITE_BUSY.

use crate::checkpoints::CheckpointStorage;
use crate::journal_store::{ChunkStatus, JournalStorage, ScanErrorRow};
use crate::retry::with_busy_retry;
use crate::{Database, Error, Result};
use parking_lot::Mutex;
use scan_core::{
    covered_chunk_starts, ensure_aligned, now_millis, ScanCheckpoint, ScanJournalEntry, ScanPhase,
    DEFAULT_CHUNK_SIZE,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

/// Journal configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// Chunk size for sessions started without an explicit one
    pub chunk_size: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// What a flush persisted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushSummary {
    /// Scan ids written
    pub entries: usize,
    /// Chunk rows written
    pub chunks: usize,
    /// Transactions added to the counters
    pub transactions: u64,
}

/// Buffered mutations of one scan id
#[derive(Debug, Clone, Default)]
struct PendingUpdate {
    /// chunk start -> matched
    chunks: BTreeMap<u64, bool>,
    tx_count: u64,
}

impl PendingUpdate {
    fn merge(&mut self, other: PendingUpdate) {
        for (chunk, matched) in other.chunks {
            *self.chunks.entry(chunk).or_insert(false) |= matched;
        }
        self.tx_count += other.tx_count;
    }

    fn is_empty(&self) -> bool {
        self.chunks.is_empty() && self.tx_count == 0
    }
}

/// Buffered updates plus the scan ids a flush is currently writing
#[derive(Debug, Default)]
struct WriteBuffer {
    updates: HashMap<String, PendingUpdate>,
    in_flight: HashMap<String, usize>,
}

impl WriteBuffer {
    /// Take every buffered update and mark its scan id in flight
    fn drain(&mut self) -> Vec<(String, PendingUpdate)> {
        let drained: Vec<(String, PendingUpdate)> =
            std::mem::take(&mut self.updates).into_iter().collect();
        for (scan_id, _) in &drained {
            *self.in_flight.entry(scan_id.clone()).or_insert(0) += 1;
        }
        drained
    }

    /// End a flush of `scan_id`, re-buffering what it failed to write
    ///
    /// The update is merged back before the in-flight mark is dropped so the
    /// scan id never looks clean in between.
    fn settle(&mut self, scan_id: &str, unwritten: Option<PendingUpdate>) {
        if let Some(update) = unwritten {
            self.updates
                .entry(scan_id.to_string())
                .or_default()
                .merge(update);
        }
        if let Some(count) = self.in_flight.get_mut(scan_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.in_flight.remove(scan_id);
            }
        }
    }

    fn is_dirty(&self, scan_id: &str) -> bool {
        self.in_flight.contains_key(scan_id)
            || self
                .updates
                .get(scan_id)
                .map(|u| !u.is_empty())
                .unwrap_or(false)
    }
}

enum FlushOutcome {
    Written { chunks: usize, transactions: u64 },
    Missing,
}

/// Scan journal and checkpoint store
///
/// Cloning is cheap; clones share the database and the write buffer.
#[derive(Clone)]
pub struct ScanJournal {
    db: Arc<Mutex<Database>>,
    config: JournalConfig,
    pending: Arc<Mutex<WriteBuffer>>,
    chunk_sizes: Arc<Mutex<HashMap<String, u64>>>,
}

impl ScanJournal {
    /// Wrap an open database
    pub fn new(db: Database, config: JournalConfig) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            config,
            pending: Arc::new(Mutex::new(WriteBuffer::default())),
            chunk_sizes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Open the journal database at `path`
    pub fn open<P: AsRef<Path>>(path: P, config: JournalConfig) -> Result<Self> {
        Ok(Self::new(Database::open(path)?, config))
    }

    /// Journal backed by a private in-memory database
    pub fn open_in_memory(config: JournalConfig) -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?, config))
    }

    /// Journal configuration
    pub fn config(&self) -> &JournalConfig {
        &self.config
    }

    /// Run `f` against the database on the blocking pool
    async fn with_db<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let mut db = db.lock();
            f(&mut db)
        })
        .await
        .map_err(|e| Error::Task(e.to_string()))?
    }

    /// Chunk size of a session, from cache or the database
    async fn chunk_size_of(&self, scan_id: &str) -> Result<u64> {
        let cached = self.chunk_sizes.lock().get(scan_id).copied();
        if let Some(size) = cached {
            return Ok(size);
        }

        let id = scan_id.to_string();
        let info = self
            .with_db(move |db| with_busy_retry(|| JournalStorage::new(db.conn()).session_info(&id)))
            .await?;

        match info {
            Some(info) => {
                self.chunk_sizes
                    .lock()
                    .insert(scan_id.to_string(), info.chunk_size);
                Ok(info.chunk_size)
            }
            None => Err(Error::NotFound(format!("scan journal {}", scan_id))),
        }
    }

    /// Start (or restart) a session with the configured chunk size
    pub async fn start_scan_journal(
        &self,
        scan_id: &str,
        wallet_address: &str,
        start_height: u64,
        target_end_height: u64,
    ) -> Result<ScanJournalEntry> {
        self.start_scan_journal_with_chunk_size(
            scan_id,
            wallet_address,
            start_height,
            target_end_height,
            self.config.chunk_size,
        )
        .await
    }

    /// Start (or restart) a session with an explicit chunk size
    ///
    /// An existing entry with the same scan id is replaced and its buffered
    /// updates are dropped.
    pub async fn start_scan_journal_with_chunk_size(
        &self,
        scan_id: &str,
        wallet_address: &str,
        start_height: u64,
        target_end_height: u64,
        chunk_size: u64,
    ) -> Result<ScanJournalEntry> {
        if chunk_size == 0 {
            return Err(scan_core::Error::InvalidChunkSize(chunk_size).into());
        }
        if start_height > target_end_height {
            return Err(Error::Validation(format!(
                "start height {} above target {}",
                start_height, target_end_height
            )));
        }

        self.pending.lock().updates.remove(scan_id);

        let entry = ScanJournalEntry::new(
            scan_id,
            wallet_address,
            start_height,
            target_end_height,
            chunk_size,
        );
        let stored = entry.clone();

        let other_active = self
            .with_db(move |db| {
                with_busy_retry(|| {
                    let tx = db.transaction()?;
                    let storage = JournalStorage::new(&tx);
                    let active = storage
                        .find_incomplete(&stored.wallet_address)?
                        .filter(|id| *id != stored.scan_id);
                    storage.replace_entry(&stored)?;
                    tx.commit()?;
                    Ok(active)
                })
            })
            .await?;

        if let Some(active) = other_active {
            tracing::warn!(
                "Starting scan {} for {} while scan {} is still incomplete",
                scan_id,
                wallet_address,
                active
            );
        }

        self.chunk_sizes
            .lock()
            .insert(scan_id.to_string(), chunk_size);

        tracing::info!(
            "Started scan journal {} for {}: [{}, {}) chunk_size={}",
            scan_id,
            wallet_address,
            start_height,
            target_end_height,
            chunk_size
        );

        Ok(entry)
    }

    /// Stage scanned chunks in the write buffer
    ///
    /// Visible through [`Self::view_journal`] immediately, durable after the
    /// next flush.
    pub async fn record_scanned_chunks(
        &self,
        scan_id: &str,
        chunk_starts: &[u64],
        matched: bool,
        tx_count: u64,
    ) -> Result<()> {
        let chunk_size = self.chunk_size_of(scan_id).await?;
        ensure_aligned(chunk_starts, chunk_size)?;

        let mut pending = self.pending.lock();
        let update = pending.updates.entry(scan_id.to_string()).or_default();
        for chunk in chunk_starts {
            *update.chunks.entry(*chunk).or_insert(false) |= matched;
        }
        update.tx_count += tx_count;

        tracing::debug!(
            "Buffered {} chunks for {} ({} pending)",
            chunk_starts.len(),
            scan_id,
            update.chunks.len()
        );

        Ok(())
    }

    /// Number of buffered chunks for a scan id
    pub fn pending_chunk_count(&self, scan_id: &str) -> usize {
        self.pending
            .lock()
            .updates
            .get(scan_id)
            .map(|u| u.chunks.len())
            .unwrap_or(0)
    }

    /// Check if anything is buffered or being flushed for a scan id
    pub fn has_pending_updates(&self, scan_id: &str) -> bool {
        self.pending.lock().is_dirty(scan_id)
    }

    /// Persist every buffered update
    ///
    /// Each scan id is written in its own transaction. Scan ids that fail
    /// are put back in the buffer and the first error is returned once all
    /// of them were attempted.
    pub async fn flush_pending_updates(&self) -> Result<FlushSummary> {
        let drained = self.pending.lock().drain();

        if drained.is_empty() {
            return Ok(FlushSummary::default());
        }

        let backup = drained.clone();
        let results = match self
            .with_db(move |db| {
                let now = now_millis();
                let results = drained
                    .into_iter()
                    .map(|(scan_id, update)| {
                        let outcome = with_busy_retry(|| flush_one(db, &scan_id, &update, now));
                        (scan_id, update, outcome)
                    })
                    .collect::<Vec<_>>();
                Ok(results)
            })
            .await
        {
            Ok(results) => results,
            Err(e) => {
                let mut pending = self.pending.lock();
                for (scan_id, update) in backup {
                    pending.settle(&scan_id, Some(update));
                }
                return Err(e);
            }
        };

        let mut summary = FlushSummary::default();
        let mut first_error = None;

        for (scan_id, update, outcome) in results {
            match outcome {
                Ok(FlushOutcome::Written {
                    chunks,
                    transactions,
                }) => {
                    self.pending.lock().settle(&scan_id, None);
                    summary.entries += 1;
                    summary.chunks += chunks;
                    summary.transactions += transactions;
                }
                Ok(FlushOutcome::Missing) => {
                    tracing::warn!(
                        "Discarding {} buffered chunks for unknown scan {}",
                        update.chunks.len(),
                        scan_id
                    );
                    self.pending.lock().settle(&scan_id, None);
                    self.chunk_sizes.lock().remove(&scan_id);
                }
                Err(e) => {
                    tracing::error!("Flush of scan {} failed: {}", scan_id, e);
                    self.pending.lock().settle(&scan_id, Some(update));
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        tracing::debug!(
            "Flushed {} chunks across {} scans ({} txs)",
            summary.chunks,
            summary.entries,
            summary.transactions
        );

        Ok(summary)
    }

    /// Durably mark chunks as handed to a worker
    pub async fn mark_chunks_in_progress(&self, scan_id: &str, chunk_starts: &[u64]) -> Result<()> {
        self.write_chunks(scan_id, chunk_starts, ChunkStatus::InProgress, false)
            .await
    }

    /// Durably mark chunks as scanned; concurrent callers union their updates
    pub async fn mark_chunks_completed(
        &self,
        scan_id: &str,
        chunk_starts: &[u64],
        matched: bool,
    ) -> Result<()> {
        self.write_chunks(scan_id, chunk_starts, ChunkStatus::Scanned, matched)
            .await
    }

    async fn write_chunks(
        &self,
        scan_id: &str,
        chunk_starts: &[u64],
        status: ChunkStatus,
        matched: bool,
    ) -> Result<()> {
        let chunk_size = self.chunk_size_of(scan_id).await?;
        ensure_aligned(chunk_starts, chunk_size)?;

        let id = scan_id.to_string();
        let chunks = chunk_starts.to_vec();
        self.with_db(move |db| {
            with_busy_retry(|| {
                let now = now_millis();
                let tx = db.transaction()?;
                let storage = JournalStorage::new(&tx);
                storage.touch(&id, 0, now)?;
                storage.upsert_chunks(&id, &chunks, status, matched, now)?;
                tx.commit()?;
                Ok(())
            })
        })
        .await
    }

    /// Count an error against a session and keep its message
    pub async fn record_scan_error(&self, scan_id: &str, message: &str) -> Result<()> {
        let id = scan_id.to_string();
        let message = message.to_string();
        self.with_db(move |db| {
            with_busy_retry(|| {
                let tx = db.transaction()?;
                JournalStorage::new(&tx).record_error(&id, &message, now_millis())?;
                tx.commit()?;
                Ok(())
            })
        })
        .await
    }

    /// Most recent errors of a session, newest first
    pub async fn recent_errors(&self, scan_id: &str, limit: u32) -> Result<Vec<ScanErrorRow>> {
        let id = scan_id.to_string();
        self.with_db(move |db| {
            with_busy_retry(|| JournalStorage::new(db.conn()).recent_errors(&id, limit))
        })
        .await
    }

    /// Move an active session between phase 1 and phase 2
    pub async fn set_phase(&self, scan_id: &str, phase: ScanPhase) -> Result<()> {
        if phase.is_complete() {
            return Err(Error::Validation(
                "complete a scan with complete_scan_journal".to_string(),
            ));
        }

        let id = scan_id.to_string();
        self.with_db(move |db| {
            with_busy_retry(|| {
                let tx = db.transaction()?;
                let storage = JournalStorage::new(&tx);
                let info = storage
                    .session_info(&id)?
                    .ok_or_else(|| Error::NotFound(format!("scan journal {}", id)))?;
                if info.phase.is_complete() {
                    return Err(Error::Validation(format!("scan {} already complete", id)));
                }
                storage.set_phase(&id, phase, now_millis())?;
                tx.commit()?;
                Ok(())
            })
        })
        .await
    }

    /// Raise the target end height, returning the stored target
    pub async fn extend_target_height(&self, scan_id: &str, target_end_height: u64) -> Result<u64> {
        let id = scan_id.to_string();
        self.with_db(move |db| {
            with_busy_retry(|| {
                JournalStorage::new(db.conn()).extend_target(&id, target_end_height, now_millis())
            })
        })
        .await
    }

    /// Lower the start height, returning the stored start
    pub async fn extend_start_height(&self, scan_id: &str, start_height: u64) -> Result<u64> {
        let id = scan_id.to_string();
        self.with_db(move |db| {
            with_busy_retry(|| {
                JournalStorage::new(db.conn()).extend_start(&id, start_height, now_millis())
            })
        })
        .await
    }

    /// Finish a session and advance the wallet checkpoint
    ///
    /// Buffered updates must be flushed first.
    pub async fn complete_scan_journal(&self, scan_id: &str, final_height: u64) -> Result<()> {
        if self.has_pending_updates(scan_id) {
            return Err(Error::PendingUpdates(scan_id.to_string()));
        }

        let id = scan_id.to_string();
        let wallet = self
            .with_db(move |db| {
                with_busy_retry(|| {
                    let now = now_millis();
                    let tx = db.transaction()?;
                    let journals = JournalStorage::new(&tx);
                    let info = journals
                        .session_info(&id)?
                        .ok_or_else(|| Error::NotFound(format!("scan journal {}", id)))?;

                    let dropped = journals.clear_in_progress(&id)?;
                    if dropped > 0 {
                        tracing::warn!(
                            "Completing scan {} with {} chunks still in progress",
                            id,
                            dropped
                        );
                    }
                    journals.set_phase(&id, ScanPhase::Complete, now)?;
                    CheckpointStorage::new(&tx).advance_completed_height(
                        &info.wallet_address,
                        final_height,
                        now,
                    )?;
                    tx.commit()?;
                    Ok(info.wallet_address)
                })
            })
            .await?;

        tracing::info!(
            "Completed scan journal {} for {} at height {}",
            scan_id,
            wallet,
            final_height
        );

        Ok(())
    }

    /// Store a verified balance at `height`
    pub async fn save_balance_checkpoint(
        &self,
        wallet_address: &str,
        balance: i64,
        height: u64,
    ) -> Result<()> {
        let wallet = wallet_address.to_string();
        self.with_db(move |db| {
            with_busy_retry(|| {
                CheckpointStorage::new(db.conn()).save_balance(&wallet, balance, height, now_millis())
            })
        })
        .await?;

        tracing::debug!(
            "Saved balance checkpoint for {}: {} at {}",
            wallet_address,
            balance,
            height
        );
        Ok(())
    }

    /// Durable entry of a session
    pub async fn get_journal(&self, scan_id: &str) -> Result<Option<ScanJournalEntry>> {
        let id = scan_id.to_string();
        self.with_db(move |db| with_busy_retry(|| JournalStorage::new(db.conn()).load_entry(&id)))
            .await
    }

    /// Most recently updated incomplete session of a wallet
    pub async fn get_incomplete_journal(
        &self,
        wallet_address: &str,
    ) -> Result<Option<ScanJournalEntry>> {
        let wallet = wallet_address.to_string();
        self.with_db(move |db| {
            with_busy_retry(|| {
                let storage = JournalStorage::new(db.conn());
                match storage.find_incomplete(&wallet)? {
                    Some(id) => storage.load_entry(&id),
                    None => Ok(None),
                }
            })
        })
        .await
    }

    /// Checkpoint of a wallet
    pub async fn get_checkpoint(&self, wallet_address: &str) -> Result<Option<ScanCheckpoint>> {
        let wallet = wallet_address.to_string();
        self.with_db(move |db| with_busy_retry(|| CheckpointStorage::new(db.conn()).get(&wallet)))
            .await
    }

    /// Every session of a wallet, newest first
    pub async fn list_journals(&self, wallet_address: &str) -> Result<Vec<ScanJournalEntry>> {
        let wallet = wallet_address.to_string();
        self.with_db(move |db| {
            with_busy_retry(|| {
                let storage = JournalStorage::new(db.conn());
                let mut entries = Vec::new();
                for id in storage.list_scan_ids(&wallet)? {
                    if let Some(entry) = storage.load_entry(&id)? {
                        entries.push(entry);
                    }
                }
                Ok(entries)
            })
        })
        .await
    }

    /// Chunks scanned by any session of a wallet with this chunk size
    pub async fn covered_chunks(
        &self,
        wallet_address: &str,
        chunk_size: u64,
    ) -> Result<BTreeSet<u64>> {
        let wallet = wallet_address.to_string();
        self.with_db(move |db| {
            with_busy_retry(|| {
                JournalStorage::new(db.conn()).scanned_chunks_for_wallet(&wallet, chunk_size)
            })
        })
        .await
    }

    /// Durable entry merged with this process's buffered updates
    pub async fn view_journal(&self, scan_id: &str) -> Result<Option<ScanJournalEntry>> {
        let Some(mut entry) = self.get_journal(scan_id).await? else {
            return Ok(None);
        };

        if let Some(update) = self.pending.lock().updates.get(scan_id) {
            for (chunk, matched) in &update.chunks {
                entry.in_progress_chunks.remove(chunk);
                entry.scanned_chunks.insert(*chunk);
                if *matched {
                    entry.matched_chunks.insert(*chunk);
                }
            }
            entry.transactions_found += update.tx_count;
        }

        Ok(Some(entry))
    }

    /// Erase every session and the checkpoint of a wallet
    ///
    /// Returns the number of sessions removed.
    pub async fn force_clean_slate(&self, wallet_address: &str) -> Result<usize> {
        let wallet = wallet_address.to_string();
        let (removed, had_checkpoint) = self
            .with_db(move |db| {
                with_busy_retry(|| {
                    let tx = db.transaction()?;
                    let removed = JournalStorage::new(&tx).delete_wallet(&wallet)?;
                    let had_checkpoint = CheckpointStorage::new(&tx).delete(&wallet)?;
                    tx.commit()?;
                    Ok((removed, had_checkpoint))
                })
            })
            .await?;

        {
            let mut pending = self.pending.lock();
            let mut sizes = self.chunk_sizes.lock();
            for id in &removed {
                pending.updates.remove(id);
                sizes.remove(id);
            }
        }

        tracing::info!(
            "Clean slate for {}: removed {} journals (checkpoint: {})",
            wallet_address,
            removed.len(),
            had_checkpoint
        );

        Ok(removed.len())
    }

    /// Anchor a wallet restored from a vault at `scanned_height`
    ///
    /// Records a completed session covering every whole chunk below the
    /// height so later scans skip them. A blank wallet address is ignored.
    pub async fn populate_checkpoint_from_vault_restore(
        &self,
        wallet_address: &str,
        scanned_height: u64,
        chunk_size: u64,
    ) -> Result<()> {
        let wallet = wallet_address.trim().to_string();
        if wallet.is_empty() {
            tracing::debug!("Vault restore without wallet address, nothing to anchor");
            return Ok(());
        }

        let mut entry = ScanJournalEntry::new(
            format!("vault-restore:{}", wallet),
            wallet.clone(),
            0,
            scanned_height,
            chunk_size,
        );
        entry.scanned_chunks = covered_chunk_starts(scanned_height, chunk_size)?.collect();
        entry.phase = ScanPhase::Complete;

        let scan_id = entry.scan_id.clone();
        let covered = entry.scanned_chunks.len();

        self.with_db(move |db| {
            with_busy_retry(|| {
                let now = now_millis();
                let tx = db.transaction()?;
                CheckpointStorage::new(&tx).anchor_restore(&entry.wallet_address, scanned_height, now)?;
                JournalStorage::new(&tx).replace_entry(&entry)?;
                tx.commit()?;
                Ok(())
            })
        })
        .await?;

        self.pending.lock().updates.remove(&scan_id);
        self.chunk_sizes.lock().insert(scan_id, chunk_size);

        tracing::info!(
            "Vault restore anchored {} at height {} ({} chunks covered)",
            wallet,
            scanned_height,
            covered
        );

        Ok(())
    }
}

/// Write one scan id's buffered chunks in a single transaction
fn flush_one(
    db: &mut Database,
    scan_id: &str,
    update: &PendingUpdate,
    now: i64,
) -> Result<FlushOutcome> {
    let tx = db.transaction()?;
    let storage = JournalStorage::new(&tx);

    if !storage.exists(scan_id)? {
        return Ok(FlushOutcome::Missing);
    }

    let (matched, unmatched): (Vec<u64>, Vec<u64>) = {
        let (m, u): (Vec<_>, Vec<_>) = update.chunks.iter().partition(|(_, matched)| **matched);
        (
            m.into_iter().map(|(c, _)| *c).collect(),
            u.into_iter().map(|(c, _)| *c).collect(),
        )
    };

    storage.upsert_chunks(scan_id, &matched, ChunkStatus::Scanned, true, now)?;
    storage.upsert_chunks(scan_id, &unmatched, ChunkStatus::Scanned, false, now)?;
    storage.touch(scan_id, update.tx_count, now)?;
    tx.commit()?;

    Ok(FlushOutcome::Written {
        chunks: update.chunks.len(),
        transactions: update.tx_count,
    })
}
