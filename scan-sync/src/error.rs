//! Error types for scan operations

use serde::{Deserialize, Serialize};

/// Result type
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Sparse data did not match its expected digest
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Worker engine used before `init`
    #[error("Engine not initialized")]
    EngineNotInitialized,

    /// `init` called on an initialized worker
    #[error("Engine already initialized")]
    AlreadyInitialized,

    /// Seed was not valid hex or was empty
    #[error("Invalid seed: {0}")]
    InvalidSeed(String),

    /// Engine could not be loaded or restored
    #[error("Engine init error: {0}")]
    EngineInit(String),

    /// Engine rejected a batch; the chunk can be retried
    #[error("Engine ingestion error: {0}")]
    EngineIngestion(String),

    /// Engine state is unusable
    #[error("Engine failed: {0}")]
    EngineFailed(String),

    /// Journal storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Chunk source error
    #[error("Source error: {0}")]
    Source(String),

    /// Malformed worker message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid scan configuration
    #[error("Config error: {0}")]
    Config(String),

    /// Worker thread is gone
    #[error("Worker closed")]
    WorkerClosed,

    /// Operation cancelled
    #[error("Cancelled")]
    Cancelled,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<scan_storage_sqlite::Error> for Error {
    fn from(e: scan_storage_sqlite::Error) -> Self {
        Error::Storage(format!("{}", e))
    }
}

impl From<scan_core::Error> for Error {
    fn from(e: scan_core::Error) -> Self {
        Error::Config(format!("{}", e))
    }
}

/// Error category carried across the worker boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Digest mismatch
    Integrity,
    /// Worker not initialized
    NotInitialized,
    /// Worker initialized twice
    AlreadyInitialized,
    /// Bad seed
    InvalidSeed,
    /// Engine load/restore failure
    EngineInit,
    /// Recoverable ingestion failure
    Ingestion,
    /// Engine unusable
    EngineFailed,
    /// Malformed message
    Protocol,
    /// Handler panicked
    Panic,
    /// Anything else
    Other,
}

impl ErrorKind {
    /// Check if a session must stop on this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Integrity | Self::NotInitialized | Self::EngineFailed)
    }
}

impl Error {
    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Integrity(_) => ErrorKind::Integrity,
            Error::EngineNotInitialized => ErrorKind::NotInitialized,
            Error::AlreadyInitialized => ErrorKind::AlreadyInitialized,
            Error::InvalidSeed(_) => ErrorKind::InvalidSeed,
            Error::EngineInit(_) => ErrorKind::EngineInit,
            Error::EngineIngestion(_) => ErrorKind::Ingestion,
            Error::EngineFailed(_) => ErrorKind::EngineFailed,
            Error::Protocol(_) => ErrorKind::Protocol,
            _ => ErrorKind::Other,
        }
    }

    /// Rebuild an error from a failure reported by a worker
    pub fn from_worker(kind: Option<ErrorKind>, message: String) -> Self {
        match kind {
            Some(ErrorKind::Integrity) => Error::Integrity(message),
            Some(ErrorKind::NotInitialized) => Error::EngineNotInitialized,
            Some(ErrorKind::AlreadyInitialized) => Error::AlreadyInitialized,
            Some(ErrorKind::InvalidSeed) => Error::InvalidSeed(message),
            Some(ErrorKind::EngineInit) => Error::EngineInit(message),
            Some(ErrorKind::Ingestion) => Error::EngineIngestion(message),
            Some(ErrorKind::EngineFailed) => Error::EngineFailed(message),
            _ => Error::Protocol(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip_through_worker() {
        let errors = [
            Error::Integrity("bad hash".into()),
            Error::EngineNotInitialized,
            Error::AlreadyInitialized,
            Error::EngineIngestion("short".into()),
            Error::EngineFailed("corrupt".into()),
        ];

        for err in errors {
            let kind = err.kind();
            let rebuilt = Error::from_worker(Some(kind), err.to_string());
            assert_eq!(rebuilt.kind(), kind);
        }
    }

    #[test]
    fn test_fatal_kinds() {
        assert!(ErrorKind::Integrity.is_fatal());
        assert!(ErrorKind::EngineFailed.is_fatal());
        assert!(!ErrorKind::Ingestion.is_fatal());
        assert!(!ErrorKind::Panic.is_fatal());
    }
}
