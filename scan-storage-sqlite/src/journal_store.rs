//! Row-level storage for scan journal entries and their chunk rows
//!
//! All functions take a borrowed connection so they compose inside a
//! caller-owned transaction (`Transaction` derefs to `Connection`).

use crate::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension};
use scan_core::{ScanJournalEntry, ScanPhase};
use std::collections::BTreeSet;

/// Chunk row status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    /// Handed to a worker, not reconciled yet
    InProgress,
    /// Fully ingested
    Scanned,
}

impl ChunkStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Scanned => "scanned",
        }
    }
}

/// Error trail row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanErrorRow {
    /// Error message
    pub message: String,
    /// When it was recorded (unix millis)
    pub created_at: i64,
}

/// Header of a journal entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Wallet the session scans for
    pub wallet_address: String,
    /// Chunk size of the session
    pub chunk_size: u64,
    /// Current phase
    pub phase: ScanPhase,
}

/// Journal row operations
pub struct JournalStorage<'a> {
    conn: &'a Connection,
}

impl<'a> JournalStorage<'a> {
    /// Create new journal storage over a connection or transaction
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Insert `entry`, replacing any entry (and chunk rows) with the same scan id
    pub fn replace_entry(&self, entry: &ScanJournalEntry) -> Result<()> {
        self.conn.execute(
            "DELETE FROM scan_journals WHERE scan_id = ?1",
            params![entry.scan_id],
        )?;

        let start_height = to_sql_int(entry.start_height, "start height")?;
        let target_end_height = to_sql_int(entry.target_end_height, "target end height")?;
        let chunk_size = to_sql_int(entry.chunk_size, "chunk size")?;
        let transactions_found = to_sql_int(entry.transactions_found, "transaction count")?;
        let error_count = to_sql_int(entry.error_count, "error count")?;
        let scanned: Vec<u64> = entry.scanned_chunks.iter().copied().collect();
        let in_progress: Vec<u64> = entry.in_progress_chunks.iter().copied().collect();

        self.conn.execute(
            r#"
            INSERT INTO scan_journals (
                scan_id, wallet_address, start_height, target_end_height, chunk_size,
                phase, transactions_found, error_count, last_error_message,
                last_update_timestamp, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                entry.scan_id,
                entry.wallet_address,
                start_height,
                target_end_height,
                chunk_size,
                entry.phase.as_str(),
                transactions_found,
                error_count,
                entry.last_error_message,
                entry.last_update_timestamp,
                entry.created_at,
            ],
        )?;

        let now = entry.last_update_timestamp;
        for chunk in &scanned {
            self.upsert_chunks(
                &entry.scan_id,
                &[*chunk],
                ChunkStatus::Scanned,
                entry.matched_chunks.contains(chunk),
                now,
            )?;
        }
        self.upsert_chunks(&entry.scan_id, &in_progress, ChunkStatus::InProgress, false, now)?;

        Ok(())
    }

    /// Load a full entry with its chunk sets
    pub fn load_entry(&self, scan_id: &str) -> Result<Option<ScanJournalEntry>> {
        let header = self
            .conn
            .query_row(
                r#"
                SELECT scan_id, wallet_address, start_height, target_end_height, chunk_size,
                       phase, transactions_found, error_count, last_error_message,
                       last_update_timestamp, created_at
                FROM scan_journals
                WHERE scan_id = ?1
                "#,
                params![scan_id],
                |row| {
                    Ok((
                        ScanJournalEntry {
                            scan_id: row.get(0)?,
                            wallet_address: row.get(1)?,
                            start_height: column_u64(row, 2)?,
                            target_end_height: column_u64(row, 3)?,
                            chunk_size: column_u64(row, 4)?,
                            scanned_chunks: BTreeSet::new(),
                            in_progress_chunks: BTreeSet::new(),
                            matched_chunks: BTreeSet::new(),
                            phase: ScanPhase::Phase1,
                            transactions_found: column_u64(row, 6)?,
                            error_count: column_u64(row, 7)?,
                            last_error_message: row.get(8)?,
                            last_update_timestamp: row.get(9)?,
                            created_at: row.get(10)?,
                        },
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((mut entry, phase)) = header else {
            return Ok(None);
        };
        entry.phase = phase.parse()?;

        let mut stmt = self.conn.prepare(
            "SELECT chunk_start, status, matched FROM scan_journal_chunks WHERE scan_id = ?1",
        )?;
        let rows = stmt.query_map(params![scan_id], |row| {
            Ok((
                column_u64(row, 0)?,
                row.get::<_, String>(1)?,
                row.get::<_, bool>(2)?,
            ))
        })?;

        for row in rows {
            let (chunk, status, matched) = row?;
            if status == ChunkStatus::Scanned.as_str() {
                entry.scanned_chunks.insert(chunk);
                if matched {
                    entry.matched_chunks.insert(chunk);
                }
            } else {
                entry.in_progress_chunks.insert(chunk);
            }
        }

        Ok(Some(entry))
    }

    /// Check whether a scan id exists
    pub fn exists(&self, scan_id: &str) -> Result<bool> {
        Ok(self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM scan_journals WHERE scan_id = ?1)",
            params![scan_id],
            |row| row.get(0),
        )?)
    }

    /// Header fields needed to validate a mutation
    pub fn session_info(&self, scan_id: &str) -> Result<Option<SessionInfo>> {
        let row = self
            .conn
            .query_row(
                "SELECT wallet_address, chunk_size, phase FROM scan_journals WHERE scan_id = ?1",
                params![scan_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        column_u64(row, 1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((wallet_address, chunk_size, phase)) => Ok(Some(SessionInfo {
                wallet_address,
                chunk_size,
                phase: phase.parse()?,
            })),
            None => Ok(None),
        }
    }

    /// Most recently updated incomplete scan id for a wallet
    pub fn find_incomplete(&self, wallet_address: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                r#"
                SELECT scan_id FROM scan_journals
                WHERE wallet_address = ?1 AND phase != 'complete'
                ORDER BY last_update_timestamp DESC, created_at DESC
                LIMIT 1
                "#,
                params![wallet_address],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Every scan id of a wallet, newest first
    pub fn list_scan_ids(&self, wallet_address: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT scan_id FROM scan_journals WHERE wallet_address = ?1 ORDER BY created_at DESC",
        )?;
        let ids = stmt
            .query_map(params![wallet_address], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    /// Upsert chunk rows
    ///
    /// Scanned rows overwrite in-progress ones and OR the matched flag.
    /// In-progress rows never demote a chunk that is already scanned.
    pub fn upsert_chunks(
        &self,
        scan_id: &str,
        chunk_starts: &[u64],
        status: ChunkStatus,
        matched: bool,
        now: i64,
    ) -> Result<()> {
        if chunk_starts.is_empty() {
            return Ok(());
        }

        let sql = match status {
            ChunkStatus::Scanned => {
                r#"
                INSERT INTO scan_journal_chunks (scan_id, chunk_start, status, matched, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(scan_id, chunk_start) DO UPDATE SET
                    status = excluded.status,
                    matched = MAX(matched, excluded.matched),
                    updated_at = excluded.updated_at
                "#
            }
            ChunkStatus::InProgress => {
                r#"
                INSERT INTO scan_journal_chunks (scan_id, chunk_start, status, matched, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(scan_id, chunk_start) DO UPDATE SET
                    updated_at = excluded.updated_at
                WHERE status = 'in_progress'
                "#
            }
        };

        let chunk_starts = chunk_starts
            .iter()
            .map(|c| to_sql_int(*c, "chunk start"))
            .collect::<Result<Vec<i64>>>()?;

        let mut stmt = self.conn.prepare_cached(sql)?;
        for chunk in chunk_starts {
            stmt.execute(params![scan_id, chunk, status.as_str(), matched, now])?;
        }

        Ok(())
    }

    /// Drop every in-progress row of an entry
    pub fn clear_in_progress(&self, scan_id: &str) -> Result<usize> {
        Ok(self.conn.execute(
            "DELETE FROM scan_journal_chunks WHERE scan_id = ?1 AND status = 'in_progress'",
            params![scan_id],
        )?)
    }

    /// Bump the update timestamp and add to the transaction counter
    pub fn touch(&self, scan_id: &str, tx_delta: u64, now: i64) -> Result<()> {
        let updated = self.conn.execute(
            r#"
            UPDATE scan_journals SET
                transactions_found = transactions_found + ?2,
                last_update_timestamp = ?3
            WHERE scan_id = ?1
            "#,
            params![scan_id, to_sql_int(tx_delta, "transaction count")?, now],
        )?;
        expect_row(updated, scan_id)
    }

    /// Count an error and keep its message
    pub fn record_error(&self, scan_id: &str, message: &str, now: i64) -> Result<()> {
        let updated = self.conn.execute(
            r#"
            UPDATE scan_journals SET
                error_count = error_count + 1,
                last_error_message = ?2,
                last_update_timestamp = ?3
            WHERE scan_id = ?1
            "#,
            params![scan_id, message, now],
        )?;
        expect_row(updated, scan_id)?;

        self.conn.execute(
            "INSERT INTO scan_errors (scan_id, message, created_at) VALUES (?1, ?2, ?3)",
            params![scan_id, message, now],
        )?;
        Ok(())
    }

    /// Most recent errors of an entry, newest first
    pub fn recent_errors(&self, scan_id: &str, limit: u32) -> Result<Vec<ScanErrorRow>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT message, created_at FROM scan_errors
            WHERE scan_id = ?1
            ORDER BY created_at DESC, id DESC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt
            .query_map(params![scan_id, limit], |row| {
                Ok(ScanErrorRow {
                    message: row.get(0)?,
                    created_at: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Set the phase of an entry
    pub fn set_phase(&self, scan_id: &str, phase: ScanPhase, now: i64) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE scan_journals SET phase = ?2, last_update_timestamp = ?3 WHERE scan_id = ?1",
            params![scan_id, phase.as_str(), now],
        )?;
        expect_row(updated, scan_id)
    }

    /// Raise the target end height; never lowers it
    pub fn extend_target(&self, scan_id: &str, target_end_height: u64, now: i64) -> Result<u64> {
        let updated = self.conn.execute(
            r#"
            UPDATE scan_journals SET
                target_end_height = MAX(target_end_height, ?2),
                last_update_timestamp = ?3
            WHERE scan_id = ?1
            "#,
            params![scan_id, to_sql_int(target_end_height, "target end height")?, now],
        )?;
        expect_row(updated, scan_id)?;

        let target: i64 = self.conn.query_row(
            "SELECT target_end_height FROM scan_journals WHERE scan_id = ?1",
            params![scan_id],
            |row| row.get(0),
        )?;
        from_sql_int(target, "target end height")
    }

    /// Lower the start height; never raises it
    pub fn extend_start(&self, scan_id: &str, start_height: u64, now: i64) -> Result<u64> {
        let updated = self.conn.execute(
            r#"
            UPDATE scan_journals SET
                start_height = MIN(start_height, ?2),
                last_update_timestamp = ?3
            WHERE scan_id = ?1
            "#,
            params![scan_id, to_sql_int(start_height, "start height")?, now],
        )?;
        expect_row(updated, scan_id)?;

        let start: i64 = self.conn.query_row(
            "SELECT start_height FROM scan_journals WHERE scan_id = ?1",
            params![scan_id],
            |row| row.get(0),
        )?;
        from_sql_int(start, "start height")
    }

    /// Delete every entry of a wallet, returning the removed scan ids
    pub fn delete_wallet(&self, wallet_address: &str) -> Result<Vec<String>> {
        let ids = self.list_scan_ids(wallet_address)?;
        self.conn.execute(
            "DELETE FROM scan_journals WHERE wallet_address = ?1",
            params![wallet_address],
        )?;
        Ok(ids)
    }

    /// Union of scanned chunks over all entries of a wallet with this chunk size
    pub fn scanned_chunks_for_wallet(
        &self,
        wallet_address: &str,
        chunk_size: u64,
    ) -> Result<BTreeSet<u64>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT DISTINCT c.chunk_start
            FROM scan_journal_chunks c
            JOIN scan_journals j ON j.scan_id = c.scan_id
            WHERE j.wallet_address = ?1 AND j.chunk_size = ?2 AND c.status = 'scanned'
            "#,
        )?;
        let chunks = stmt
            .query_map(
                params![wallet_address, to_sql_int(chunk_size, "chunk size")?],
                |row| column_u64(row, 0),
            )?
            .collect::<std::result::Result<BTreeSet<u64>, _>>()?;
        Ok(chunks)
    }
}

/// Bind a height or counter as an SQLite integer
pub(crate) fn to_sql_int(value: u64, what: &str) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| Error::Validation(format!("{} {} exceeds the storable range", what, value)))
}

/// Read back a stored height or counter
pub(crate) fn from_sql_int(value: i64, what: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| Error::Validation(format!("negative {} {}", what, value)))
}

/// Non-negative integer column, for use inside row mappers
pub(crate) fn column_u64(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(idx)?;
    u64::try_from(value).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, value))
}

fn expect_row(updated: usize, scan_id: &str) -> Result<()> {
    if updated == 0 {
        return Err(Error::NotFound(format!("scan journal {}", scan_id)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn entry(scan_id: &str, wallet: &str) -> ScanJournalEntry {
        ScanJournalEntry::new(scan_id, wallet, 0, 10_000, 1000)
    }

    #[test]
    fn test_replace_and_load() {
        let db = Database::open_in_memory().unwrap();
        let storage = JournalStorage::new(db.conn());

        let mut e = entry("s1", "w1");
        e.scanned_chunks.extend([0, 1000]);
        e.matched_chunks.insert(1000);
        e.in_progress_chunks.insert(2000);
        storage.replace_entry(&e).unwrap();

        let loaded = storage.load_entry("s1").unwrap().unwrap();
        assert_eq!(loaded, e);
    }

    #[test]
    fn test_replace_drops_old_chunks() {
        let db = Database::open_in_memory().unwrap();
        let storage = JournalStorage::new(db.conn());

        let mut e = entry("s1", "w1");
        e.scanned_chunks.insert(0);
        storage.replace_entry(&e).unwrap();
        storage.replace_entry(&entry("s1", "w1")).unwrap();

        let loaded = storage.load_entry("s1").unwrap().unwrap();
        assert!(loaded.scanned_chunks.is_empty());
    }

    #[test]
    fn test_missing_entry_is_none() {
        let db = Database::open_in_memory().unwrap();
        let storage = JournalStorage::new(db.conn());
        assert!(storage.load_entry("nope").unwrap().is_none());
        assert!(!storage.exists("nope").unwrap());
    }

    #[test]
    fn test_matched_flag_is_sticky() {
        let db = Database::open_in_memory().unwrap();
        let storage = JournalStorage::new(db.conn());
        storage.replace_entry(&entry("s1", "w1")).unwrap();

        storage.upsert_chunks("s1", &[0], ChunkStatus::Scanned, true, 1).unwrap();
        storage.upsert_chunks("s1", &[0], ChunkStatus::Scanned, false, 2).unwrap();

        let loaded = storage.load_entry("s1").unwrap().unwrap();
        assert!(loaded.matched_chunks.contains(&0));
    }

    #[test]
    fn test_in_progress_never_demotes_scanned() {
        let db = Database::open_in_memory().unwrap();
        let storage = JournalStorage::new(db.conn());
        storage.replace_entry(&entry("s1", "w1")).unwrap();

        storage.upsert_chunks("s1", &[0], ChunkStatus::Scanned, false, 1).unwrap();
        storage.upsert_chunks("s1", &[0, 1000], ChunkStatus::InProgress, false, 2).unwrap();

        let loaded = storage.load_entry("s1").unwrap().unwrap();
        assert!(loaded.scanned_chunks.contains(&0));
        assert_eq!(loaded.in_progress_chunks.iter().copied().collect::<Vec<_>>(), vec![1000]);
        assert!(loaded.is_consistent());
    }

    #[test]
    fn test_extend_target_is_monotonic() {
        let db = Database::open_in_memory().unwrap();
        let storage = JournalStorage::new(db.conn());
        storage.replace_entry(&entry("s1", "w1")).unwrap();

        assert_eq!(storage.extend_target("s1", 20_000, 1).unwrap(), 20_000);
        assert_eq!(storage.extend_target("s1", 5_000, 2).unwrap(), 20_000);
    }

    #[test]
    fn test_extend_start_only_lowers() {
        let db = Database::open_in_memory().unwrap();
        let storage = JournalStorage::new(db.conn());
        let mut e = entry("s1", "w1");
        e.start_height = 5_000;
        storage.replace_entry(&e).unwrap();

        assert_eq!(storage.extend_start("s1", 2_000, 1).unwrap(), 2_000);
        assert_eq!(storage.extend_start("s1", 4_000, 2).unwrap(), 2_000);
        assert_eq!(storage.load_entry("s1").unwrap().unwrap().start_height, 2_000);
    }

    #[test]
    fn test_heights_beyond_sqlite_range_are_rejected() {
        let db = Database::open_in_memory().unwrap();
        let storage = JournalStorage::new(db.conn());

        let mut e = entry("s1", "w1");
        e.target_end_height = u64::MAX;
        let err = storage.replace_entry(&e).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(!storage.exists("s1").unwrap());

        storage.replace_entry(&entry("s1", "w1")).unwrap();
        let huge = i64::MAX as u64 + 1;
        let err = storage
            .upsert_chunks("s1", &[0, huge], ChunkStatus::Scanned, false, 1)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(storage.load_entry("s1").unwrap().unwrap().scanned_chunks.is_empty());

        let err = storage.extend_target("s1", huge, 2).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_negative_column_is_not_wrapped() {
        let db = Database::open_in_memory().unwrap();
        let storage = JournalStorage::new(db.conn());
        storage.replace_entry(&entry("s1", "w1")).unwrap();
        db.conn()
            .execute("UPDATE scan_journals SET start_height = -1 WHERE scan_id = 's1'", [])
            .unwrap();

        assert!(storage.load_entry("s1").is_err());
    }

    #[test]
    fn test_record_error_unknown_scan() {
        let db = Database::open_in_memory().unwrap();
        let storage = JournalStorage::new(db.conn());
        let err = storage.record_error("nope", "boom", 1).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_error_trail() {
        let db = Database::open_in_memory().unwrap();
        let storage = JournalStorage::new(db.conn());
        storage.replace_entry(&entry("s1", "w1")).unwrap();

        storage.record_error("s1", "first", 1).unwrap();
        storage.record_error("s1", "second", 2).unwrap();

        let errors = storage.recent_errors("s1", 10).unwrap();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].message, "second");

        let loaded = storage.load_entry("s1").unwrap().unwrap();
        assert_eq!(loaded.error_count, 2);
        assert_eq!(loaded.last_error_message.as_deref(), Some("second"));
    }

    #[test]
    fn test_find_incomplete_prefers_latest() {
        let db = Database::open_in_memory().unwrap();
        let storage = JournalStorage::new(db.conn());

        let mut old = entry("old", "w1");
        old.last_update_timestamp = 10;
        let mut new = entry("new", "w1");
        new.last_update_timestamp = 20;
        let mut done = entry("done", "w1");
        done.phase = ScanPhase::Complete;
        done.last_update_timestamp = 30;

        storage.replace_entry(&old).unwrap();
        storage.replace_entry(&new).unwrap();
        storage.replace_entry(&done).unwrap();

        assert_eq!(storage.find_incomplete("w1").unwrap().as_deref(), Some("new"));
        assert_eq!(storage.find_incomplete("w2").unwrap(), None);
    }

    #[test]
    fn test_delete_wallet_cascades_chunks() {
        let db = Database::open_in_memory().unwrap();
        let storage = JournalStorage::new(db.conn());

        let mut e = entry("s1", "w1");
        e.scanned_chunks.insert(0);
        storage.replace_entry(&e).unwrap();
        storage.replace_entry(&entry("s2", "w2")).unwrap();

        let removed = storage.delete_wallet("w1").unwrap();
        assert_eq!(removed, vec!["s1".to_string()]);

        let orphans: i64 = db
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM scan_journal_chunks WHERE scan_id = 's1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(orphans, 0);
        assert!(storage.exists("s2").unwrap());
    }
}
