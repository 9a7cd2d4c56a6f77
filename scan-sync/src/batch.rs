//! Batch processor
//!
//! Owns one wallet engine for the lifetime of a worker, verifies sparse
//! chunk data against its expected digest and ingests it. All operations
//! match on the explicit [`ProcessorState`].

use crate::engine::{
    EngineError, EngineFactory, IngestResult, ScopedBuffer, TransferQuery, Transfers, WalletEngine,
};
use crate::error::{Error, ErrorKind, Result};
use scan_core::{Network, WorkerBatchMarker};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Instant;
use subtle::ConstantTimeEq;

/// Account restored by `init`
pub const DEFAULT_ACCOUNT: u32 = 0;

/// Batch processor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Network the engine restores on
    pub network: Network,
    /// Account index to restore
    pub account: u32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            account: DEFAULT_ACCOUNT,
        }
    }
}

/// Result of one `process` call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    /// Batch ingested
    pub success: bool,
    /// Wallet transactions found
    pub txs_matched: u64,
    /// Transactions examined
    pub txs_processed: u64,
    /// Net balance change
    pub balance_change: i64,
    /// Stake heights known after the batch
    pub stake_heights: Vec<u64>,
    /// Wall time spent
    pub elapsed_seconds: f64,
    /// Failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Failure category
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Last batch this worker ingested, on success and failure alike
    pub last_successful_batch: WorkerBatchMarker,
}

/// Processor state
pub enum ProcessorState {
    /// No engine loaded yet
    Uninitialized,
    /// Engine restored and usable
    Ready {
        /// Owned engine
        engine: Box<dyn WalletEngine>,
        /// Primary address of the restored account
        address: String,
    },
    /// Engine reported corruption; terminal
    Failed {
        /// Why
        reason: String,
    },
}

impl ProcessorState {
    /// State name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Ready { .. } => "ready",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Hex SHA-256 of `data`
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Check `data` against a hex SHA-256 digest in constant time
///
/// Undecodable or wrongly sized digests fail closed.
pub fn verify_digest(data: &[u8], expected_hex: &str) -> Result<()> {
    let expected = hex::decode(expected_hex.trim())
        .map_err(|e| Error::Integrity(format!("undecodable digest: {}", e)))?;
    if expected.len() != 32 {
        return Err(Error::Integrity(format!(
            "digest has {} bytes, expected 32",
            expected.len()
        )));
    }

    let actual = Sha256::digest(data);
    if bool::from(actual.as_slice().ct_eq(&expected)) {
        Ok(())
    } else {
        Err(Error::Integrity("sparse data hash mismatch".to_string()))
    }
}

/// Batch processor
pub struct BatchProcessor {
    factory: Arc<dyn EngineFactory>,
    config: BatchConfig,
    state: ProcessorState,
    marker: WorkerBatchMarker,
}

impl BatchProcessor {
    /// Create an uninitialized processor
    pub fn new(factory: Arc<dyn EngineFactory>, config: BatchConfig) -> Self {
        Self {
            factory,
            config,
            state: ProcessorState::Uninitialized,
            marker: WorkerBatchMarker::default(),
        }
    }

    /// Current state
    pub fn state(&self) -> &ProcessorState {
        &self.state
    }

    /// Current state name
    pub fn state_name(&self) -> &'static str {
        self.state.name()
    }

    /// Check if the engine hit a terminal failure
    pub fn is_failed(&self) -> bool {
        matches!(self.state, ProcessorState::Failed { .. })
    }

    /// Primary address once initialized
    pub fn address(&self) -> Option<&str> {
        match &self.state {
            ProcessorState::Ready { address, .. } => Some(address),
            _ => None,
        }
    }

    /// Load the engine and restore the wallet; allowed once
    ///
    /// On failure the processor stays uninitialized.
    pub fn init(&mut self, seed_hex: &str, password: &str, engine_version: Option<&str>) -> Result<String> {
        match &self.state {
            ProcessorState::Uninitialized => {}
            ProcessorState::Ready { .. } => return Err(Error::AlreadyInitialized),
            ProcessorState::Failed { reason } => return Err(Error::EngineFailed(reason.clone())),
        }

        let seed = hex::decode(seed_hex.trim()).map_err(|e| Error::InvalidSeed(e.to_string()))?;
        if seed.is_empty() {
            return Err(Error::InvalidSeed("empty seed".to_string()));
        }

        let mut engine = self
            .factory
            .load(engine_version)
            .map_err(|e| Error::EngineInit(e.to_string()))?;
        let address = engine
            .restore_from_seed(&seed, password, self.config.network, self.config.account)
            .map_err(|e| Error::EngineInit(e.to_string()))?;

        tracing::info!(
            "Worker engine ready on {} (account {})",
            self.config.network,
            self.config.account
        );

        self.state = ProcessorState::Ready {
            engine,
            address: address.clone(),
        };
        Ok(address)
    }

    /// Verify and ingest one chunk of sparse data
    ///
    /// Never returns an error: failures are reported in the outcome together
    /// with the last successful batch marker.
    pub fn process(
        &mut self,
        sparse_data: &[u8],
        start_height: u64,
        batch_id: Option<String>,
        expected_hash: Option<&str>,
    ) -> BatchOutcome {
        let started = Instant::now();

        match self.try_process(sparse_data, start_height, expected_hash) {
            Ok((ingest, stake_heights)) => {
                self.marker = WorkerBatchMarker::succeeded(batch_id, start_height);
                tracing::debug!(
                    "Batch at {} ingested: {} matched / {} processed",
                    start_height,
                    ingest.txs_matched,
                    ingest.txs_processed
                );

                BatchOutcome {
                    success: true,
                    txs_matched: ingest.txs_matched,
                    txs_processed: ingest.txs_processed,
                    balance_change: ingest.balance_change,
                    stake_heights,
                    elapsed_seconds: started.elapsed().as_secs_f64(),
                    error: None,
                    error_kind: None,
                    last_successful_batch: self.marker.clone(),
                }
            }
            Err(e) => {
                tracing::warn!("Batch at {} failed: {}", start_height, e);
                BatchOutcome {
                    success: false,
                    elapsed_seconds: started.elapsed().as_secs_f64(),
                    error: Some(e.to_string()),
                    error_kind: Some(e.kind()),
                    last_successful_batch: self.marker.clone(),
                    ..Default::default()
                }
            }
        }
    }

    fn try_process(
        &mut self,
        sparse_data: &[u8],
        start_height: u64,
        expected_hash: Option<&str>,
    ) -> Result<(IngestResult, Vec<u64>)> {
        let engine = match &mut self.state {
            ProcessorState::Uninitialized => return Err(Error::EngineNotInitialized),
            ProcessorState::Failed { reason } => return Err(Error::EngineFailed(reason.clone())),
            ProcessorState::Ready { engine, .. } => engine,
        };

        // Nothing reaches the engine before the digest checks out
        if let Some(expected) = expected_hash {
            verify_digest(sparse_data, expected)?;
        }

        let result = ingest(engine.as_mut(), sparse_data, start_height);

        match result {
            Ok(done) => Ok(done),
            Err(EngineError::Corrupted(reason)) => {
                tracing::error!("Engine corrupted at height {}: {}", start_height, reason);
                self.state = ProcessorState::Failed {
                    reason: reason.clone(),
                };
                Err(Error::EngineFailed(reason))
            }
            Err(e) => Err(Error::EngineIngestion(e.to_string())),
        }
    }

    /// Last batch ingested by this processor
    pub fn get_checkpoint(&self) -> WorkerBatchMarker {
        self.marker.clone()
    }

    /// Engine balance
    pub fn get_balance(&self) -> Result<i64> {
        self.ready_engine()?.get_balance().map_err(engine_read_error)
    }

    /// Engine stake heights
    pub fn get_stake_heights(&self) -> Result<Vec<u64>> {
        self.ready_engine()?
            .get_stake_heights()
            .map_err(engine_read_error)
    }

    /// Engine transfers
    pub fn get_transfers(&self, query: &TransferQuery) -> Result<Transfers> {
        self.ready_engine()?
            .get_transfers(query)
            .map_err(engine_read_error)
    }

    fn ready_engine(&self) -> Result<&dyn WalletEngine> {
        match &self.state {
            ProcessorState::Ready { engine, .. } => Ok(engine.as_ref()),
            ProcessorState::Uninitialized => Err(Error::EngineNotInitialized),
            ProcessorState::Failed { reason } => Err(Error::EngineFailed(reason.clone())),
        }
    }
}

fn ingest(
    engine: &mut dyn WalletEngine,
    sparse_data: &[u8],
    start_height: u64,
) -> std::result::Result<(IngestResult, Vec<u64>), EngineError> {
    let ingest = {
        let mut buffer = ScopedBuffer::acquire(&mut *engine, sparse_data)?;
        buffer.ingest(start_height, true)?
    };
    let stake_heights = engine.get_stake_heights()?;
    Ok((ingest, stake_heights))
}

fn engine_read_error(e: EngineError) -> Error {
    match e {
        EngineError::Corrupted(reason) => Error::EngineFailed(reason),
        other => Error::EngineIngestion(other.to_string()),
    }
}
