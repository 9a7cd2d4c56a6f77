//! Per-wallet scan checkpoints
//!
//! One row per wallet anchoring the highest height a completed scan reached
//! and the last verified balance. `last_completed_height` only moves up.

use crate::journal_store::{column_u64, to_sql_int};
use crate::Result;
use rusqlite::{params, Connection, OptionalExtension};
use scan_core::ScanCheckpoint;

/// Checkpoint storage
pub struct CheckpointStorage<'a> {
    conn: &'a Connection,
}

impl<'a> CheckpointStorage<'a> {
    /// Create new checkpoint storage over a connection or transaction
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Load the checkpoint of a wallet
    pub fn get(&self, wallet_address: &str) -> Result<Option<ScanCheckpoint>> {
        let checkpoint = self
            .conn
            .query_row(
                r#"
                SELECT wallet_address, last_completed_height, balance_at_checkpoint,
                       height_at_checkpoint, timestamp
                FROM scan_checkpoints
                WHERE wallet_address = ?1
                "#,
                params![wallet_address],
                |row| {
                    Ok(ScanCheckpoint {
                        wallet_address: row.get(0)?,
                        last_completed_height: column_u64(row, 1)?,
                        balance_at_checkpoint: row.get(2)?,
                        height_at_checkpoint: column_u64(row, 3)?,
                        timestamp: row.get(4)?,
                    })
                },
            )
            .optional()?;

        Ok(checkpoint)
    }

    /// Raise `last_completed_height` to at least `height`, creating the row if needed
    pub fn advance_completed_height(&self, wallet_address: &str, height: u64, now: i64) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO scan_checkpoints (wallet_address, last_completed_height, timestamp)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(wallet_address) DO UPDATE SET
                last_completed_height = MAX(last_completed_height, excluded.last_completed_height),
                timestamp = excluded.timestamp
            "#,
            params![wallet_address, to_sql_int(height, "height")?, now],
        )?;
        Ok(())
    }

    /// Store a verified balance at `height`; a new row starts with no completed height
    pub fn save_balance(&self, wallet_address: &str, balance: i64, height: u64, now: i64) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO scan_checkpoints (
                wallet_address, last_completed_height, balance_at_checkpoint,
                height_at_checkpoint, timestamp
            ) VALUES (?1, 0, ?2, ?3, ?4)
            ON CONFLICT(wallet_address) DO UPDATE SET
                balance_at_checkpoint = excluded.balance_at_checkpoint,
                height_at_checkpoint = excluded.height_at_checkpoint,
                timestamp = excluded.timestamp
            "#,
            params![wallet_address, balance, to_sql_int(height, "height")?, now],
        )?;
        Ok(())
    }

    /// Anchor a restored wallet at `height`
    pub fn anchor_restore(&self, wallet_address: &str, height: u64, now: i64) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO scan_checkpoints (
                wallet_address, last_completed_height, height_at_checkpoint, timestamp
            ) VALUES (?1, ?2, ?2, ?3)
            ON CONFLICT(wallet_address) DO UPDATE SET
                last_completed_height = MAX(last_completed_height, excluded.last_completed_height),
                height_at_checkpoint = excluded.height_at_checkpoint,
                timestamp = excluded.timestamp
            "#,
            params![wallet_address, to_sql_int(height, "height")?, now],
        )?;
        Ok(())
    }

    /// Delete the checkpoint of a wallet
    pub fn delete(&self, wallet_address: &str) -> Result<bool> {
        let deleted = self.conn.execute(
            "DELETE FROM scan_checkpoints WHERE wallet_address = ?1",
            params![wallet_address],
        )?;
        Ok(deleted > 0)
    }
}
