//! Wallet engine boundary
//!
//! The engine (key derivation, transaction parsing, balances) is opaque to the
//! scanner. A worker owns exactly one instance and hands it sparse data
//! through engine-side buffers.

use scan_core::Network;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Engine-side buffer handle
pub type BufferHandle = u64;

/// Engine failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// Batch could not be ingested; retrying the chunk is safe
    #[error("ingestion failed: {0}")]
    Ingestion(String),

    /// Seed restore failed
    #[error("restore failed: {0}")]
    Restore(String),

    /// Buffer allocation or write failed
    #[error("buffer error: {0}")]
    Buffer(String),

    /// Engine state is unusable
    #[error("engine corrupted: {0}")]
    Corrupted(String),
}

/// Result of ingesting one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestResult {
    /// Wallet transactions found in the batch
    pub txs_matched: u64,
    /// Transactions examined
    pub txs_processed: u64,
    /// Net balance change
    pub balance_change: i64,
}

/// Filter for [`WalletEngine::get_transfers`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferQuery {
    /// Lowest height, inclusive
    pub min_height: u64,
    /// Highest height, inclusive
    pub max_height: u64,
    /// Include incoming transfers
    pub include_in: bool,
    /// Include outgoing transfers
    pub include_out: bool,
    /// Include unconfirmed transfers
    pub include_pending: bool,
}

impl Default for TransferQuery {
    fn default() -> Self {
        Self {
            min_height: 0,
            max_height: u64::MAX,
            include_in: true,
            include_out: true,
            include_pending: false,
        }
    }
}

/// One wallet transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    /// Engine transaction id (hex)
    pub txid: String,
    /// Block height
    pub height: u64,
    /// Absolute amount
    pub amount: u64,
    /// Unconfirmed
    pub pending: bool,
}

/// Transfers split by direction
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfers {
    /// Incoming
    #[serde(rename = "in")]
    pub incoming: Vec<Transfer>,
    /// Outgoing
    #[serde(rename = "out")]
    pub outgoing: Vec<Transfer>,
}

/// Opaque wallet engine
pub trait WalletEngine: Send {
    /// Restore `account` from a seed, returning its primary address
    fn restore_from_seed(
        &mut self,
        seed: &[u8],
        password: &str,
        network: Network,
        account: u32,
    ) -> Result<String, EngineError>;

    /// Allocate an engine-side buffer of `len` bytes
    fn allocate_buffer(&mut self, len: usize) -> Result<BufferHandle, EngineError>;

    /// Copy `data` into a buffer
    fn write_buffer(&mut self, handle: BufferHandle, data: &[u8]) -> Result<(), EngineError>;

    /// Release a buffer
    fn free_buffer(&mut self, handle: BufferHandle);

    /// Ingest the sparse transactions held in a buffer
    fn ingest_sparse_transactions(
        &mut self,
        handle: BufferHandle,
        length: usize,
        start_height: u64,
        skip_prefilter: bool,
    ) -> Result<IngestResult, EngineError>;

    /// Current balance
    fn get_balance(&self) -> Result<i64, EngineError>;

    /// Heights of stake outputs
    fn get_stake_heights(&self) -> Result<Vec<u64>, EngineError>;

    /// Transfers matching `query`
    fn get_transfers(&self, query: &TransferQuery) -> Result<Transfers, EngineError>;
}

/// Loads engine instances
pub trait EngineFactory: Send + Sync {
    /// Load an engine, optionally pinned to a version
    fn load(&self, version: Option<&str>) -> Result<Box<dyn WalletEngine>, EngineError>;
}

impl<F: EngineFactory + ?Sized> EngineFactory for Arc<F> {
    fn load(&self, version: Option<&str>) -> Result<Box<dyn WalletEngine>, EngineError> {
        (**self).load(version)
    }
}

/// Engine buffer holding a copy of some bytes, freed on drop
///
/// Drop runs on success, error return and unwind alike.
pub struct ScopedBuffer<'a, E: WalletEngine + ?Sized> {
    engine: &'a mut E,
    handle: BufferHandle,
    len: usize,
}

impl<'a, E: WalletEngine + ?Sized> ScopedBuffer<'a, E> {
    /// Allocate a buffer and copy `data` into it
    pub fn acquire(engine: &'a mut E, data: &[u8]) -> Result<Self, EngineError> {
        let handle = engine.allocate_buffer(data.len())?;
        if let Err(e) = engine.write_buffer(handle, data) {
            engine.free_buffer(handle);
            return Err(e);
        }
        Ok(Self {
            engine,
            handle,
            len: data.len(),
        })
    }

    /// Buffer handle
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    /// Bytes held
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Ingest the buffer contents
    pub fn ingest(&mut self, start_height: u64, skip_prefilter: bool) -> Result<IngestResult, EngineError> {
        self.engine
            .ingest_sparse_transactions(self.handle, self.len, start_height, skip_prefilter)
    }
}

impl<E: WalletEngine + ?Sized> Drop for ScopedBuffer<'_, E> {
    fn drop(&mut self) {
        self.engine.free_buffer(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct CountingEngine {
        next: BufferHandle,
        live: HashMap<BufferHandle, Vec<u8>>,
        fail_write: bool,
        panic_on_ingest: bool,
    }

    impl WalletEngine for CountingEngine {
        fn restore_from_seed(
            &mut self,
            _seed: &[u8],
            _password: &str,
            _network: Network,
            _account: u32,
        ) -> Result<String, EngineError> {
            Ok("addr".into())
        }

        fn allocate_buffer(&mut self, len: usize) -> Result<BufferHandle, EngineError> {
            self.next += 1;
            self.live.insert(self.next, Vec::with_capacity(len));
            Ok(self.next)
        }

        fn write_buffer(&mut self, handle: BufferHandle, data: &[u8]) -> Result<(), EngineError> {
            if self.fail_write {
                return Err(EngineError::Buffer("write refused".into()));
            }
            self.live
                .get_mut(&handle)
                .ok_or_else(|| EngineError::Buffer("unknown handle".into()))?
                .extend_from_slice(data);
            Ok(())
        }

        fn free_buffer(&mut self, handle: BufferHandle) {
            self.live.remove(&handle);
        }

        fn ingest_sparse_transactions(
            &mut self,
            handle: BufferHandle,
            length: usize,
            _start_height: u64,
            _skip_prefilter: bool,
        ) -> Result<IngestResult, EngineError> {
            if self.panic_on_ingest {
                panic!("engine blew up");
            }
            assert_eq!(self.live[&handle].len(), length);
            Ok(IngestResult {
                txs_processed: length as u64,
                ..Default::default()
            })
        }

        fn get_balance(&self) -> Result<i64, EngineError> {
            Ok(0)
        }

        fn get_stake_heights(&self) -> Result<Vec<u64>, EngineError> {
            Ok(vec![])
        }

        fn get_transfers(&self, _query: &TransferQuery) -> Result<Transfers, EngineError> {
            Ok(Transfers::default())
        }
    }

    #[test]
    fn test_buffer_freed_after_ingest() {
        let mut engine = CountingEngine::default();
        {
            let mut buffer = ScopedBuffer::acquire(&mut engine, b"hello").unwrap();
            assert_eq!(buffer.len(), 5);
            assert_eq!(buffer.ingest(0, true).unwrap().txs_processed, 5);
        }
        assert!(engine.live.is_empty());
    }

    #[test]
    fn test_buffer_freed_when_write_fails() {
        let mut engine = CountingEngine {
            fail_write: true,
            ..Default::default()
        };
        assert!(ScopedBuffer::acquire(&mut engine, b"hello").is_err());
        assert!(engine.live.is_empty());
    }

    #[test]
    fn test_buffer_freed_on_unwind() {
        let mut engine = CountingEngine {
            panic_on_ingest: true,
            ..Default::default()
        };

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut buffer = ScopedBuffer::acquire(&mut engine, b"hello").unwrap();
            let _ = buffer.ingest(0, true);
        }));

        assert!(result.is_err());
        assert!(engine.live.is_empty());
    }

    #[test]
    fn test_transfer_query_defaults() {
        let query: TransferQuery = serde_json::from_str("{\"min_height\": 10}").unwrap();
        assert_eq!(query.min_height, 10);
        assert_eq!(query.max_height, u64::MAX);
        assert!(query.include_in && query.include_out);
        assert!(!query.include_pending);
    }
}
