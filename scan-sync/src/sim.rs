//! Deterministic in-memory engine and chain
//!
//! Sparse data is a sequence of fixed 40-byte records:
//! `height (u64 LE) | amount (i64 LE) | flags | owner tag (23 bytes)`.
//! Flag bit 0 marks a stake output. A record belongs to a wallet when its
//! owner tag is the first 23 bytes of the SHA-256 of the wallet address.

use crate::batch::sha256_hex;
use crate::engine::{
    BufferHandle, EngineError, EngineFactory, IngestResult, Transfer, TransferQuery, Transfers,
    WalletEngine,
};
use crate::error::{Error, Result};
use crate::source::{ChunkSource, SparseChunk};
use async_trait::async_trait;
use parking_lot::Mutex;
use scan_core::Network;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Encoded record size
pub const RECORD_LEN: usize = 40;

/// Owner tag size
pub const TAG_LEN: usize = 23;

/// Version reported by the simulated factory
pub const SIM_ENGINE_VERSION: &str = "sim-1";

const STAKE_FLAG: u8 = 0x01;
const FOREIGN_TAG: [u8; TAG_LEN] = [0xee; TAG_LEN];

/// One simulated transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimRecord {
    /// Block height
    pub height: u64,
    /// Signed amount; negative is outgoing
    pub amount: i64,
    /// Stake output
    pub stake: bool,
    /// Owner tag
    pub owner: [u8; TAG_LEN],
}

impl SimRecord {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.height.to_le_bytes());
        out.extend_from_slice(&self.amount.to_le_bytes());
        out.push(if self.stake { STAKE_FLAG } else { 0 });
        out.extend_from_slice(&self.owner);
    }

    fn decode(bytes: &[u8; RECORD_LEN]) -> Self {
        let mut height = [0u8; 8];
        let mut amount = [0u8; 8];
        let mut owner = [0u8; TAG_LEN];
        height.copy_from_slice(&bytes[0..8]);
        amount.copy_from_slice(&bytes[8..16]);
        owner.copy_from_slice(&bytes[17..]);
        Self {
            height: u64::from_le_bytes(height),
            amount: i64::from_le_bytes(amount),
            stake: bytes[16] & STAKE_FLAG != 0,
            owner,
        }
    }
}

/// Encode records into sparse data
pub fn encode_records(records: &[SimRecord]) -> Vec<u8> {
    let mut out = Vec::with_capacity(records.len() * RECORD_LEN);
    for record in records {
        record.encode_into(&mut out);
    }
    out
}

/// Owner tag of a wallet address
pub fn owner_tag(address: &str) -> [u8; TAG_LEN] {
    let digest = Sha256::digest(address.as_bytes());
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&digest[..TAG_LEN]);
    tag
}

/// Address the simulated engine restores for a seed
pub fn derive_address(seed: &[u8], network: Network, account: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed);
    hasher.update(account.to_le_bytes());
    let digest = hasher.finalize();
    format!("sim{}1{}", network, hex::encode(&digest[..16]))
}

/// Counters shared between a factory, its engines and the test
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    ingest_calls: Arc<AtomicU64>,
    live_buffers: Arc<AtomicI64>,
}

impl EngineStats {
    /// Calls to `ingest_sparse_transactions`
    pub fn ingest_calls(&self) -> u64 {
        self.ingest_calls.load(Ordering::SeqCst)
    }

    /// Buffers allocated and not yet freed
    pub fn live_buffers(&self) -> i64 {
        self.live_buffers.load(Ordering::SeqCst)
    }
}

/// In-memory wallet engine
pub struct SimulatedEngine {
    address: Option<String>,
    tag: [u8; TAG_LEN],
    buffers: HashMap<BufferHandle, Vec<u8>>,
    next_handle: BufferHandle,
    seen: HashSet<[u8; RECORD_LEN]>,
    balance: i64,
    stake_heights: BTreeSet<u64>,
    transfers: Vec<Transfer>,
    outgoing: HashSet<String>,
    corrupt_at: Option<u64>,
    stats: EngineStats,
}

impl SimulatedEngine {
    fn new(corrupt_at: Option<u64>, stats: EngineStats) -> Self {
        Self {
            address: None,
            tag: [0u8; TAG_LEN],
            buffers: HashMap::new(),
            next_handle: 0,
            seen: HashSet::new(),
            balance: 0,
            stake_heights: BTreeSet::new(),
            transfers: Vec::new(),
            outgoing: HashSet::new(),
            corrupt_at,
            stats,
        }
    }
}

impl WalletEngine for SimulatedEngine {
    fn restore_from_seed(
        &mut self,
        seed: &[u8],
        _password: &str,
        network: Network,
        account: u32,
    ) -> std::result::Result<String, EngineError> {
        if seed.len() < 16 {
            return Err(EngineError::Restore(format!(
                "seed too short: {} bytes",
                seed.len()
            )));
        }
        let address = derive_address(seed, network, account);
        self.tag = owner_tag(&address);
        self.address = Some(address.clone());
        Ok(address)
    }

    fn allocate_buffer(&mut self, len: usize) -> std::result::Result<BufferHandle, EngineError> {
        self.next_handle += 1;
        self.buffers.insert(self.next_handle, Vec::with_capacity(len));
        self.stats.live_buffers.fetch_add(1, Ordering::SeqCst);
        Ok(self.next_handle)
    }

    fn write_buffer(
        &mut self,
        handle: BufferHandle,
        data: &[u8],
    ) -> std::result::Result<(), EngineError> {
        let buffer = self
            .buffers
            .get_mut(&handle)
            .ok_or_else(|| EngineError::Buffer(format!("unknown buffer {}", handle)))?;
        buffer.clear();
        buffer.extend_from_slice(data);
        Ok(())
    }

    fn free_buffer(&mut self, handle: BufferHandle) {
        if self.buffers.remove(&handle).is_some() {
            self.stats.live_buffers.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn ingest_sparse_transactions(
        &mut self,
        handle: BufferHandle,
        length: usize,
        start_height: u64,
        _skip_prefilter: bool,
    ) -> std::result::Result<IngestResult, EngineError> {
        self.stats.ingest_calls.fetch_add(1, Ordering::SeqCst);

        if self.address.is_none() {
            return Err(EngineError::Ingestion("wallet not restored".to_string()));
        }
        if self.corrupt_at == Some(start_height) {
            return Err(EngineError::Corrupted(format!(
                "wallet state corrupted at {}",
                start_height
            )));
        }

        let data = self
            .buffers
            .get(&handle)
            .ok_or_else(|| EngineError::Buffer(format!("unknown buffer {}", handle)))?;
        if data.len() != length || length % RECORD_LEN != 0 {
            return Err(EngineError::Ingestion(format!(
                "malformed sparse data: {} bytes",
                length
            )));
        }

        let mut result = IngestResult::default();
        let mut fresh = Vec::new();
        for raw in data.chunks_exact(RECORD_LEN) {
            let mut bytes = [0u8; RECORD_LEN];
            bytes.copy_from_slice(raw);
            let record = SimRecord::decode(&bytes);
            result.txs_processed += 1;
            if record.owner != self.tag {
                continue;
            }
            result.txs_matched += 1;
            fresh.push((bytes, record));
        }

        // Re-ingesting a batch leaves the wallet state unchanged
        for (bytes, record) in fresh {
            if !self.seen.insert(bytes) {
                continue;
            }
            self.balance += record.amount;
            result.balance_change += record.amount;
            if record.stake {
                self.stake_heights.insert(record.height);
            }
            let txid = sha256_hex(&bytes);
            if record.amount < 0 {
                self.outgoing.insert(txid.clone());
            }
            self.transfers.push(Transfer {
                txid,
                height: record.height,
                amount: record.amount.unsigned_abs(),
                pending: false,
            });
        }

        Ok(result)
    }

    fn get_balance(&self) -> std::result::Result<i64, EngineError> {
        Ok(self.balance)
    }

    fn get_stake_heights(&self) -> std::result::Result<Vec<u64>, EngineError> {
        Ok(self.stake_heights.iter().copied().collect())
    }

    fn get_transfers(&self, query: &TransferQuery) -> std::result::Result<Transfers, EngineError> {
        let mut transfers = Transfers::default();
        for transfer in &self.transfers {
            if transfer.height < query.min_height || transfer.height > query.max_height {
                continue;
            }
            if transfer.pending && !query.include_pending {
                continue;
            }
            if self.outgoing.contains(&transfer.txid) {
                if query.include_out {
                    transfers.outgoing.push(transfer.clone());
                }
            } else if query.include_in {
                transfers.incoming.push(transfer.clone());
            }
        }
        Ok(transfers)
    }
}

/// Factory of [`SimulatedEngine`]s
#[derive(Debug, Clone, Default)]
pub struct SimulatedEngineFactory {
    corrupt_at: Option<u64>,
    stats: EngineStats,
}

impl SimulatedEngineFactory {
    /// Factory of healthy engines
    pub fn new() -> Self {
        Self::default()
    }

    /// Engines report corruption when asked to ingest a batch starting here
    pub fn corrupt_at(mut self, start_height: u64) -> Self {
        self.corrupt_at = Some(start_height);
        self
    }

    /// Counters of every engine this factory loaded
    pub fn stats(&self) -> EngineStats {
        self.stats.clone()
    }
}

impl EngineFactory for SimulatedEngineFactory {
    fn load(&self, version: Option<&str>) -> std::result::Result<Box<dyn WalletEngine>, EngineError> {
        match version {
            None | Some(SIM_ENGINE_VERSION) => Ok(Box::new(SimulatedEngine::new(
                self.corrupt_at,
                self.stats.clone(),
            ))),
            Some(other) => Err(EngineError::Restore(format!(
                "unknown engine version {}",
                other
            ))),
        }
    }
}

/// Deterministic chain serving sparse chunks
///
/// Every chunk holds one foreign transaction. Every `match_every`-th chunk
/// also holds one transaction of the wallet, paying `amount`.
pub struct SimulatedChain {
    wallet_tag: [u8; TAG_LEN],
    match_every: u64,
    stake_every: Option<u64>,
    amount: i64,
    failing: Mutex<HashMap<u64, u32>>,
    tampered: Mutex<HashSet<u64>>,
    fetches: AtomicU64,
}

impl SimulatedChain {
    /// Chain paying `wallet_address` in every chunk
    pub fn new(wallet_address: &str) -> Self {
        Self {
            wallet_tag: owner_tag(wallet_address),
            match_every: 1,
            stake_every: None,
            amount: 1_000,
            failing: Mutex::new(HashMap::new()),
            tampered: Mutex::new(HashSet::new()),
            fetches: AtomicU64::new(0),
        }
    }

    /// Pay the wallet only every `n` chunks
    pub fn with_match_every(mut self, n: u64) -> Self {
        self.match_every = n.max(1);
        self
    }

    /// Mark every `n`-th wallet payment as a stake output
    pub fn with_stake_every(mut self, n: u64) -> Self {
        self.stake_every = Some(n.max(1));
        self
    }

    /// Amount of each wallet payment
    pub fn with_amount(mut self, amount: i64) -> Self {
        self.amount = amount;
        self
    }

    /// Fail the next `times` fetches of a chunk
    pub fn fail_fetch(&self, chunk_start: u64, times: u32) {
        self.failing.lock().insert(chunk_start, times);
    }

    /// Serve a chunk with data that does not match its digest
    pub fn tamper(&self, chunk_start: u64) {
        self.tampered.lock().insert(chunk_start);
    }

    /// Stop tampering with a chunk
    pub fn repair(&self, chunk_start: u64) {
        self.tampered.lock().remove(&chunk_start);
    }

    /// Fetches served or refused so far
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Check whether the wallet is paid in this chunk
    pub fn pays_wallet(&self, chunk_start: u64, chunk_size: u64) -> bool {
        chunk_size > 0 && (chunk_start / chunk_size) % self.match_every == 0
    }

    /// Wallet balance after ingesting every chunk in `chunks`
    pub fn expected_balance<'a, I>(&self, chunks: I, chunk_size: u64) -> i64
    where
        I: IntoIterator<Item = &'a u64>,
    {
        chunks
            .into_iter()
            .filter(|c| self.pays_wallet(**c, chunk_size))
            .count() as i64
            * self.amount
    }

    /// Sparse data of a chunk, untampered
    pub fn chunk_data(&self, chunk_start: u64, chunk_size: u64) -> Vec<u8> {
        let mut records = vec![SimRecord {
            height: chunk_start,
            amount: 7,
            stake: false,
            owner: FOREIGN_TAG,
        }];

        if self.pays_wallet(chunk_start, chunk_size) {
            let payment = chunk_start / chunk_size / self.match_every;
            let stake = self
                .stake_every
                .map(|n| payment % n == 0)
                .unwrap_or(false);
            records.push(SimRecord {
                height: chunk_start + chunk_size / 2,
                amount: self.amount,
                stake,
                owner: self.wallet_tag,
            });
        }

        encode_records(&records)
    }
}

#[async_trait]
impl ChunkSource for SimulatedChain {
    async fn fetch_chunk(&self, chunk_start: u64, chunk_size: u64) -> Result<SparseChunk> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        {
            let mut failing = self.failing.lock();
            if let Some(remaining) = failing.get_mut(&chunk_start) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Error::Source(format!(
                        "chunk {} temporarily unavailable",
                        chunk_start
                    )));
                }
            }
        }

        let mut sparse_data = self.chunk_data(chunk_start, chunk_size);
        let expected_hash = sha256_hex(&sparse_data);
        if self.tampered.lock().contains(&chunk_start) {
            sparse_data[0] ^= 0xff;
        }

        Ok(SparseChunk {
            chunk_start,
            start_height: chunk_start,
            sparse_data,
            batch_id: Some(format!("chunk-{}", chunk_start)),
            expected_hash: Some(expected_hash),
        })
    }
}
