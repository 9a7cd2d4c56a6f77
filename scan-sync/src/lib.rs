//! Resumable wallet scan
//!
//! Recovery decisions over the scan journal, the batch worker that feeds
//! sparse chunk data to a wallet engine, and the coordinator that drives a
//! session across workers.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::result_large_err)]

pub mod batch;
pub mod cancel;
pub mod engine;
pub mod error;
pub mod progress;
pub mod protocol;
pub mod recovery;
pub mod scanner;
#[cfg(feature = "test-helpers")]
pub mod sim;
pub mod source;
pub mod worker;

pub use batch::{
    sha256_hex, verify_digest, BatchConfig, BatchOutcome, BatchProcessor, ProcessorState,
    DEFAULT_ACCOUNT,
};
pub use cancel::CancelToken;
pub use engine::{
    BufferHandle, EngineError, EngineFactory, IngestResult, ScopedBuffer, Transfer,
    TransferQuery, Transfers, WalletEngine,
};
pub use error::{Error, ErrorKind, Result};
pub use progress::{ProgressSnapshot, ScanProgress, ScanStage};
pub use protocol::{parse_request, InitPayload, ProcessPayload, Request, Response};
pub use recovery::{
    InterruptionStatus, RecoveryAction, RecoveryAssessment, RecoveryConfig, RecoveryValidator,
    ResumePlan, DEFAULT_MAX_GAP_CHUNKS, DEFAULT_MAX_GAP_FRACTION,
};
pub use scanner::{ScanConfig, ScanCoordinator, ScanReport, ScanRequest, DEFAULT_FLUSH_INTERVAL};
pub use source::{ChunkSource, SparseChunk};
pub use worker::{dispatch, spawn_worker, Control, WorkerConfig, WorkerHandle, DEFAULT_QUEUE_DEPTH};
