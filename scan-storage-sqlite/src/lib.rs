//! SQLite storage for the scan journal
//!
//! Durable chunk progress per scan session, per-wallet checkpoints, schema
//! migrations and SQLITE_BUSY retry. [`ScanJournal`] is the async entry
//! point; the row-level storage types compose inside a transaction.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod checkpoints;
pub mod database;
pub mod error;
pub mod journal;
pub mod journal_store;
pub mod migrations;
pub mod retry;

pub use checkpoints::CheckpointStorage;
pub use database::Database;
pub use error::{Error, Result};
pub use journal::{FlushSummary, JournalConfig, ScanJournal};
pub use journal_store::{ChunkStatus, JournalStorage, ScanErrorRow, SessionInfo};
pub use migrations::{get_schema_version, run_migrations};
pub use retry::with_busy_retry;
