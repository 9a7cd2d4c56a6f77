//! Error types

/// Result type
pub type Result<T> = std::result::Result<T, Error>;

/// Chunk model errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Chunk size must be positive
    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(u64),

    /// Chunk start is not a multiple of the session chunk size
    #[error("Chunk start {start} is not aligned to chunk size {chunk_size}")]
    Misaligned {
        /// Offending chunk start
        start: u64,
        /// Session chunk size
        chunk_size: u64,
    },

    /// Height range is inverted
    #[error("Invalid range: start {start} > end {end}")]
    InvalidRange {
        /// Range start
        start: u64,
        /// Range end
        end: u64,
    },

    /// Unknown network name
    #[error("Invalid network: {0}")]
    InvalidNetwork(String),

    /// Unknown scan phase name
    #[error("Invalid scan phase: {0}")]
    InvalidPhase(String),
}
