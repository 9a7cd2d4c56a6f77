//! Wallet scan core
//!
//! Chunk model, gap detection and the shared data model of the resumable
//! scan journal. Everything in this crate is pure: no I/O, no clocks except
//! for timestamp helpers.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod chunk;
pub mod error;
pub mod gaps;
pub mod models;
pub mod network;

pub use chunk::{
    align_down, chunk_count, chunk_starts, covered_chunk_starts, ensure_aligned, is_aligned,
    ChunkRange, DEFAULT_CHUNK_SIZE,
};
pub use error::{Error, Result};
pub use gaps::{contiguous_frontier, detect_gaps};
pub use models::{
    now_millis, ScanCheckpoint, ScanJournalEntry, ScanPhase, WorkerBatchMarker,
};
pub use network::Network;
