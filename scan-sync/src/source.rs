//! Sparse chunk data source

use crate::error::Result;
use async_trait::async_trait;

/// Pre-filtered transaction data for one chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseChunk {
    /// Aligned chunk start
    pub chunk_start: u64,
    /// First height the data covers
    pub start_height: u64,
    /// Engine-specific sparse transaction bytes
    pub sparse_data: Vec<u8>,
    /// Supplier's batch id
    pub batch_id: Option<String>,
    /// Hex SHA-256 of `sparse_data`; data without one is ingested unchecked
    pub expected_hash: Option<String>,
}

/// Supplier of sparse chunk data
#[async_trait]
pub trait ChunkSource: Send + Sync {
    /// Fetch the data of the chunk starting at `chunk_start`
    async fn fetch_chunk(&self, chunk_start: u64, chunk_size: u64) -> Result<SparseChunk>;
}
