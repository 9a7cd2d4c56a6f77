//! Batch processor and worker protocol tests

use scan_core::Network;
use scan_sync::engine::{BufferHandle, EngineError, IngestResult};
use scan_sync::sim::{SimulatedChain, SimulatedEngineFactory};
use scan_sync::{
    dispatch, sha256_hex, spawn_worker, BatchConfig, BatchProcessor, ChunkSource, Control,
    EngineFactory, Error, ErrorKind, Request, Response, TransferQuery, Transfers, WalletEngine,
    WorkerConfig,
};
use serde_json::Value;
use std::sync::Arc;

fn seed_hex() -> String {
    hex::encode([7u8; 32])
}

fn processor(factory: &SimulatedEngineFactory) -> BatchProcessor {
    BatchProcessor::new(Arc::new(factory.clone()), BatchConfig::default())
}

// ============================================================================
// Batch processor
// ============================================================================

#[tokio::test]
async fn test_tampered_batch_never_reaches_engine() {
    let factory = SimulatedEngineFactory::new();
    let stats = factory.stats();
    let mut processor = processor(&factory);
    let address = processor.init(&seed_hex(), "", None).unwrap();

    let chain = SimulatedChain::new(&address);
    chain.tamper(0);
    let chunk = chain.fetch_chunk(0, 1000).await.unwrap();

    let outcome = processor.process(
        &chunk.sparse_data,
        0,
        Some("b1".to_string()),
        chunk.expected_hash.as_deref(),
    );

    assert!(!outcome.success);
    assert_eq!(outcome.error_kind, Some(ErrorKind::Integrity));
    assert_eq!(stats.ingest_calls(), 0);
    assert!(!outcome.last_successful_batch.is_set());
}

#[test]
fn test_failure_echoes_last_successful_batch() {
    let factory = SimulatedEngineFactory::new();
    let mut processor = processor(&factory);
    let address = processor.init(&seed_hex(), "", None).unwrap();
    let chain = SimulatedChain::new(&address);

    let good = chain.chunk_data(0, 1000);
    let outcome = processor.process(&good, 0, Some("b1".to_string()), Some(&sha256_hex(&good)));
    assert!(outcome.success);
    assert_eq!(outcome.txs_matched, 1);
    assert_eq!(outcome.balance_change, 1_000);

    let next = chain.chunk_data(1000, 1000);
    let outcome = processor.process(&next, 1000, Some("b2".to_string()), Some(&sha256_hex(&good)));
    assert!(!outcome.success);
    assert_eq!(outcome.last_successful_batch.id.as_deref(), Some("b1"));
    assert_eq!(outcome.last_successful_batch.height, 0);
    assert_eq!(processor.get_checkpoint().id.as_deref(), Some("b1"));
}

#[test]
fn test_process_before_init_fails_without_side_effects() {
    let factory = SimulatedEngineFactory::new();
    let stats = factory.stats();
    let mut processor = processor(&factory);

    let outcome = processor.process(b"", 0, None, None);
    assert!(!outcome.success);
    assert_eq!(outcome.error_kind, Some(ErrorKind::NotInitialized));
    assert_eq!(processor.state_name(), "uninitialized");
    assert_eq!(stats.ingest_calls(), 0);
}

#[test]
fn test_init_validation() {
    let factory = SimulatedEngineFactory::new();
    let mut processor = processor(&factory);

    assert!(matches!(
        processor.init("zz", "", None),
        Err(Error::InvalidSeed(_))
    ));
    assert!(matches!(
        processor.init(&hex::encode([1u8; 4]), "", None),
        Err(Error::EngineInit(_))
    ));
    assert!(matches!(
        processor.init(&seed_hex(), "", Some("v9")),
        Err(Error::EngineInit(_))
    ));
    assert_eq!(processor.state_name(), "uninitialized");

    let address = processor.init(&seed_hex(), "", None).unwrap();
    assert_eq!(processor.address(), Some(address.as_str()));
    assert!(matches!(
        processor.init(&seed_hex(), "", None),
        Err(Error::AlreadyInitialized)
    ));
}

#[test]
fn test_network_changes_address() {
    let factory = SimulatedEngineFactory::new();
    let mut mainnet = processor(&factory);
    let mut testnet = BatchProcessor::new(
        Arc::new(factory),
        BatchConfig {
            network: Network::Testnet,
            ..Default::default()
        },
    );
    assert_ne!(
        mainnet.init(&seed_hex(), "", None).unwrap(),
        testnet.init(&seed_hex(), "", None).unwrap()
    );
}

#[test]
fn test_corruption_is_terminal() {
    let factory = SimulatedEngineFactory::new().corrupt_at(1000);
    let mut processor = processor(&factory);
    let address = processor.init(&seed_hex(), "", None).unwrap();
    let chain = SimulatedChain::new(&address);

    let data = chain.chunk_data(1000, 1000);
    let outcome = processor.process(&data, 1000, None, None);
    assert_eq!(outcome.error_kind, Some(ErrorKind::EngineFailed));
    assert!(processor.is_failed());

    let data = chain.chunk_data(2000, 1000);
    let outcome = processor.process(&data, 2000, None, None);
    assert_eq!(outcome.error_kind, Some(ErrorKind::EngineFailed));
    assert!(processor.get_balance().is_err());
}

#[test]
fn test_unchecked_batch_is_ingested() {
    let factory = SimulatedEngineFactory::new();
    let stats = factory.stats();
    let mut processor = processor(&factory);
    let address = processor.init(&seed_hex(), "", None).unwrap();
    let chain = SimulatedChain::new(&address).with_stake_every(1);

    let data = chain.chunk_data(0, 1000);
    let outcome = processor.process(&data, 0, None, None);
    assert!(outcome.success);
    assert_eq!(outcome.stake_heights, vec![500]);
    assert_eq!(stats.ingest_calls(), 1);
    assert_eq!(stats.live_buffers(), 0);
}

// ============================================================================
// Dispatch
// ============================================================================

struct PanickingEngine;

impl WalletEngine for PanickingEngine {
    fn restore_from_seed(
        &mut self,
        _seed: &[u8],
        _password: &str,
        _network: Network,
        _account: u32,
    ) -> Result<String, EngineError> {
        Ok("panic-wallet".to_string())
    }

    fn allocate_buffer(&mut self, _len: usize) -> Result<BufferHandle, EngineError> {
        Ok(1)
    }

    fn write_buffer(&mut self, _handle: BufferHandle, _data: &[u8]) -> Result<(), EngineError> {
        Ok(())
    }

    fn free_buffer(&mut self, _handle: BufferHandle) {}

    fn ingest_sparse_transactions(
        &mut self,
        _handle: BufferHandle,
        _length: usize,
        _start_height: u64,
        _skip_prefilter: bool,
    ) -> Result<IngestResult, EngineError> {
        panic!("engine bug");
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

struct PanickingFactory;

impl EngineFactory for PanickingFactory {
    fn load(&self, _version: Option<&str>) -> Result<Box<dyn WalletEngine>, EngineError> {
        Ok(Box::new(PanickingEngine))
    }
}

#[test]
fn test_dispatch_contains_panics() {
    let mut processor = BatchProcessor::new(Arc::new(PanickingFactory), BatchConfig::default());
    processor.init(&seed_hex(), "", None).unwrap();

    let request = Request::Process(scan_sync::ProcessPayload::new(b"x", 0, None, None));
    let (response, control) = dispatch(&mut processor, 9, request);

    assert_eq!(response.id, 9);
    assert!(!response.success);
    assert_eq!(response.error_kind, Some(ErrorKind::Panic));
    assert_eq!(control, Control::Continue);
}

// ============================================================================
// Worker thread
// ============================================================================

#[tokio::test]
async fn test_worker_round_trip() {
    let factory = SimulatedEngineFactory::new();
    let worker = spawn_worker(Arc::new(factory), WorkerConfig::default()).unwrap();

    let address = worker.init(&seed_hex(), "pw", None).await.unwrap();
    let chain = SimulatedChain::new(&address);

    for chunk_start in [0u64, 1000] {
        let chunk = chain.fetch_chunk(chunk_start, 1000).await.unwrap();
        let outcome = worker
            .process(
                &chunk.sparse_data,
                chunk.start_height,
                chunk.batch_id,
                chunk.expected_hash,
            )
            .await
            .unwrap();
        assert!(outcome.success);
    }

    let marker = worker.get_checkpoint().await.unwrap();
    assert_eq!(marker.id.as_deref(), Some("chunk-1000"));
    assert_eq!(marker.height, 1000);
    assert_eq!(worker.get_balance().await.unwrap(), 2_000);

    let transfers = worker.get_transfers(TransferQuery::default()).await.unwrap();
    assert_eq!(transfers.incoming.len(), 2);
    assert!(worker.get_stake_heights().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_worker_failure_is_a_response() {
    let worker = spawn_worker(
        Arc::new(SimulatedEngineFactory::new()),
        WorkerConfig::default(),
    )
    .unwrap();

    let outcome = worker.process(b"data", 0, None, None).await.unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.error_kind, Some(ErrorKind::NotInitialized));

    assert!(matches!(
        worker.get_balance().await,
        Err(Error::EngineNotInitialized)
    ));
    assert!(!worker.is_closed());
}

#[tokio::test]
async fn test_corrupted_worker_stops() {
    let factory = SimulatedEngineFactory::new().corrupt_at(0);
    let worker = spawn_worker(Arc::new(factory), WorkerConfig::default()).unwrap();
    let address = worker.init(&seed_hex(), "", None).await.unwrap();
    let data = SimulatedChain::new(&address).chunk_data(0, 1000);

    let outcome = worker.process(&data, 0, None, None).await.unwrap();
    assert_eq!(outcome.error_kind, Some(ErrorKind::EngineFailed));

    assert!(matches!(
        worker.get_balance().await,
        Err(Error::WorkerClosed)
    ));
}

#[tokio::test]
async fn test_raw_json_echoes_ids() {
    let worker = spawn_worker(
        Arc::new(SimulatedEngineFactory::new()),
        WorkerConfig::default(),
    )
    .unwrap();

    let init = Request::Init(scan_sync::InitPayload {
        seed_hex: seed_hex(),
        password: String::new(),
        engine_version: None,
    })
    .to_json(41)
    .unwrap();
    let reply: Response = serde_json::from_str(&worker.handle_json(&init).await.unwrap()).unwrap();
    assert_eq!(reply.id, 41);
    assert_eq!(reply.kind, "init_result");
    assert!(reply.success);
    assert!(reply.data.contains_key("address"));

    let reply: Value = serde_json::from_str(
        &worker
            .handle_json(r#"{"type": "get_balance", "id": 42}"#)
            .await
            .unwrap(),
    )
    .unwrap();
    assert_eq!(reply["id"], 42);
    assert_eq!(reply["type"], "get_balance_result");
    assert_eq!(reply["balance"], 0);

    let reply: Value = serde_json::from_str(
        &worker
            .handle_json(r#"{"type": "rewind", "id": 43}"#)
            .await
            .unwrap(),
    )
    .unwrap();
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["id"], 43);
    assert_eq!(reply["success"], false);

    let reply: Value =
        serde_json::from_str(&worker.handle_json("{not json").await.unwrap()).unwrap();
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["id"], 0);
}

#[tokio::test]
async fn test_concurrent_requests_get_their_own_responses() {
    let worker = spawn_worker(
        Arc::new(SimulatedEngineFactory::new()),
        WorkerConfig::default(),
    )
    .unwrap();
    let address = worker.init(&seed_hex(), "", None).await.unwrap();
    let chain = Arc::new(SimulatedChain::new(&address));

    let mut tasks = Vec::new();
    for i in 0..8u64 {
        let worker = worker.clone();
        let chain = Arc::clone(&chain);
        tasks.push(tokio::spawn(async move {
            let chunk = chain.fetch_chunk(i * 1000, 1000).await.unwrap();
            worker
                .process(
                    &chunk.sparse_data,
                    chunk.start_height,
                    chunk.batch_id,
                    chunk.expected_hash,
                )
                .await
                .unwrap()
        }));
    }
    for task in tasks {
        assert!(task.await.unwrap().success);
    }

    assert_eq!(worker.get_balance().await.unwrap(), 8_000);
}
