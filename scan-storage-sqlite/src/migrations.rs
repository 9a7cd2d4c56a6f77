//! Database schema migrations

use crate::{Error, Result};
use rusqlite::Connection;

const SCHEMA_VERSION: i32 = 3;

/// Run all migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    tracing::debug!(
        "Running migrations: current_version={}, target_version={}",
        current_version,
        SCHEMA_VERSION
    );

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    if current_version < 2 {
        migrate_v2(conn)?;
    }

    if current_version < 3 {
        migrate_v3(conn)?;
    }

    if current_version != SCHEMA_VERSION {
        set_schema_version(conn, SCHEMA_VERSION)?;
    }

    Ok(())
}

/// Current schema version, 0 for a fresh database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    let result = conn.query_row(
        "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
        [],
        |row| row.get(0),
    );

    match result {
        Ok(v) => Ok(v),
        Err(_) => Ok(0),
    }
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
        [],
    )?;

    let inserted = conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    if inserted > 0 {
        tracing::debug!("Inserted schema version {}", version);
    }

    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY);

        -- One row per scan session
        CREATE TABLE scan_journals (
            scan_id TEXT PRIMARY KEY,
            wallet_address TEXT NOT NULL,
            start_height INTEGER NOT NULL,
            target_end_height INTEGER NOT NULL,
            chunk_size INTEGER NOT NULL CHECK (chunk_size > 0),
            phase TEXT NOT NULL DEFAULT 'phase1' CHECK (phase IN ('phase1', 'phase2', 'complete')),
            transactions_found INTEGER NOT NULL DEFAULT 0,
            error_count INTEGER NOT NULL DEFAULT 0,
            last_error_message TEXT,
            last_update_timestamp INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        );

        -- One row per chunk: a chunk is either in progress or scanned, never both
        CREATE TABLE scan_journal_chunks (
            scan_id TEXT NOT NULL,
            chunk_start INTEGER NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('in_progress', 'scanned')),
            matched BOOLEAN NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (scan_id, chunk_start),
            FOREIGN KEY (scan_id) REFERENCES scan_journals(scan_id) ON DELETE CASCADE
        );

        CREATE TABLE scan_checkpoints (
            wallet_address TEXT PRIMARY KEY,
            last_completed_height INTEGER NOT NULL DEFAULT 0,
            balance_at_checkpoint INTEGER NOT NULL DEFAULT 0,
            height_at_checkpoint INTEGER NOT NULL DEFAULT 0,
            timestamp INTEGER NOT NULL
        );
        "#,
    )
    .map_err(|e| Error::Migration(e.to_string()))?;

    Ok(())
}

fn migrate_v2(conn: &Connection) -> Result<()> {
    // Active-journal lookup and per-status chunk loads
    conn.execute_batch(
        r#"
        CREATE INDEX IF NOT EXISTS idx_scan_journals_wallet
            ON scan_journals(wallet_address, phase, last_update_timestamp DESC);
        CREATE INDEX IF NOT EXISTS idx_scan_journal_chunks_status
            ON scan_journal_chunks(scan_id, status);
        "#,
    )
    .map_err(|e| Error::Migration(e.to_string()))?;

    Ok(())
}

fn migrate_v3(conn: &Connection) -> Result<()> {
    // Diagnostic trail of scan errors; the journal row only keeps the last one
    conn.execute_batch(
        r#"
        CREATE TABLE scan_errors (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            scan_id TEXT NOT NULL,
            message TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (scan_id) REFERENCES scan_journals(scan_id) ON DELETE CASCADE
        );

        CREATE INDEX idx_scan_errors_scan ON scan_errors(scan_id, created_at DESC);
        "#,
    )
    .map_err(|e| Error::Migration(e.to_string()))?;

    Ok(())
}
