//! Error types

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Chunk model error
    #[error("Chunk error: {0}")]
    Core(#[from] scan_core::Error),

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(String),

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Completion attempted while buffered chunk records are unflushed
    #[error("Scan {0} has unflushed chunk records")]
    PendingUpdates(String),

    /// Blocking storage task failed to run
    #[error("Storage task error: {0}")]
    Task(String),
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;
