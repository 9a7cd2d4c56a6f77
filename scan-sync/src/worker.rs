//! Batch worker thread
//!
//! One worker is one OS thread owning one [`BatchProcessor`]. Requests are
//! handled strictly in order; each response echoes its request id.

use crate::batch::{BatchConfig, BatchOutcome, BatchProcessor, ProcessorState};
use crate::engine::{EngineFactory, TransferQuery, Transfers};
use crate::error::{Error, ErrorKind, Result};
use crate::protocol::{
    parse_request, BalanceData, CheckpointData, InitData, InitPayload, ProcessPayload, Request,
    Response, StakeHeightsData,
};
use scan_core::WorkerBatchMarker;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Default request queue depth per worker
pub const DEFAULT_QUEUE_DEPTH: usize = 16;

/// Worker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Thread name
    pub name: String,
    /// Processor configuration
    pub batch: BatchConfig,
    /// Requests buffered before `request` waits
    pub queue_depth: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "scan-worker".to_string(),
            batch: BatchConfig::default(),
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

/// What the worker loop does after a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    /// Keep serving
    Continue,
    /// Engine is unusable; stop the loop
    Fatal(String),
}

/// Handle one request against a processor
///
/// Never panics out: a panicking handler becomes a failure response.
pub fn dispatch(processor: &mut BatchProcessor, id: u64, request: Request) -> (Response, Control) {
    let kind = request.kind();

    let response = match catch_unwind(AssertUnwindSafe(|| handle(processor, id, request))) {
        Ok(response) => response,
        Err(panic) => {
            let message = panic_message(&*panic);
            tracing::error!("Worker handler for {} #{} panicked: {}", kind, id, message);
            let mut response = Response::failure(
                kind,
                id,
                &Error::Protocol(format!("worker panicked: {}", message)),
            );
            response.error_kind = Some(ErrorKind::Panic);
            response
        }
    };

    let control = match processor.state() {
        ProcessorState::Failed { reason } => Control::Fatal(reason.clone()),
        _ => Control::Continue,
    };

    (response, control)
}

fn handle(processor: &mut BatchProcessor, id: u64, request: Request) -> Response {
    let kind = request.kind();
    let reply = |result: Result<Response>| result.unwrap_or_else(|e| Response::failure(kind, id, &e));

    match request {
        Request::Init(payload) => reply(
            processor
                .init(
                    &payload.seed_hex,
                    &payload.password,
                    payload.engine_version.as_deref(),
                )
                .map(|address| Response::ok(kind, id, &InitData { address })),
        ),
        Request::Process(payload) => reply(payload.decode_data().map(|data| {
            let outcome = processor.process(
                &data,
                payload.start_height,
                payload.batch_id.clone(),
                payload.expected_hash.as_deref(),
            );
            Response::from_outcome(id, &outcome)
        })),
        Request::GetCheckpoint => Response::ok(
            kind,
            id,
            &CheckpointData {
                checkpoint: processor.get_checkpoint(),
            },
        ),
        Request::GetBalance => reply(
            processor
                .get_balance()
                .map(|balance| Response::ok(kind, id, &BalanceData { balance })),
        ),
        Request::GetStakeHeights => reply(
            processor
                .get_stake_heights()
                .map(|stake_heights| Response::ok(kind, id, &StakeHeightsData { stake_heights })),
        ),
        Request::GetTransfers(query) => reply(
            processor
                .get_transfers(&query)
                .map(|transfers| Response::ok(kind, id, &transfers)),
        ),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct Job {
    id: u64,
    request: Request,
    reply: oneshot::Sender<Response>,
}

/// Handle to a worker thread
///
/// Clones share the thread and the id counter. The thread exits once every
/// handle is dropped or the engine fails.
#[derive(Clone)]
pub struct WorkerHandle {
    name: String,
    tx: mpsc::Sender<Job>,
    next_id: Arc<AtomicU64>,
}

/// Start a worker thread
pub fn spawn_worker(factory: Arc<dyn EngineFactory>, config: WorkerConfig) -> Result<WorkerHandle> {
    let (tx, mut rx) = mpsc::channel::<Job>(config.queue_depth.max(1));
    let name = config.name.clone();

    std::thread::Builder::new()
        .name(config.name.clone())
        .spawn(move || {
            let mut processor = BatchProcessor::new(factory, config.batch);
            tracing::debug!("Worker {} started", config.name);

            while let Some(job) = rx.blocking_recv() {
                let (response, control) = dispatch(&mut processor, job.id, job.request);
                if job.reply.send(response).is_err() {
                    tracing::debug!("Worker {}: caller dropped request #{}", config.name, job.id);
                }
                if let Control::Fatal(reason) = control {
                    tracing::error!("Worker {} stopping: {}", config.name, reason);
                    break;
                }
            }

            tracing::debug!("Worker {} stopped", config.name);
        })?;

    Ok(WorkerHandle {
        name,
        tx,
        next_id: Arc::new(AtomicU64::new(1)),
    })
}

impl WorkerHandle {
    /// Worker name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if the worker thread has exited
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Send a request under a fresh id and wait for its response
    pub async fn request(&self, request: Request) -> Result<Response> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let response = self.send(id, request).await?;
        if response.id != id {
            return Err(Error::Protocol(format!(
                "response id {} does not match request {}",
                response.id, id
            )));
        }
        Ok(response)
    }

    /// Speak the raw JSON protocol; the caller's id is echoed
    pub async fn handle_json(&self, text: &str) -> Result<String> {
        let response = match parse_request(text) {
            Ok((id, request)) => self.send(id, request).await?,
            Err(response) => response,
        };
        response.to_json()
    }

    async fn send(&self, id: u64, request: Request) -> Result<Response> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Job { id, request, reply })
            .await
            .map_err(|_| Error::WorkerClosed)?;
        rx.await.map_err(|_| Error::WorkerClosed)
    }

    /// Restore the worker's wallet, returning its address
    pub async fn init(
        &self,
        seed_hex: &str,
        password: &str,
        engine_version: Option<&str>,
    ) -> Result<String> {
        let response = self
            .request(Request::Init(InitPayload {
                seed_hex: seed_hex.to_string(),
                password: password.to_string(),
                engine_version: engine_version.map(str::to_string),
            }))
            .await?;
        Ok(response.into_data::<InitData>()?.address)
    }

    /// Verify and ingest one batch
    ///
    /// Batch failures come back as an unsuccessful outcome, not an error.
    pub async fn process(
        &self,
        sparse_data: &[u8],
        start_height: u64,
        batch_id: Option<String>,
        expected_hash: Option<String>,
    ) -> Result<BatchOutcome> {
        let response = self
            .request(Request::Process(ProcessPayload::new(
                sparse_data,
                start_height,
                batch_id,
                expected_hash,
            )))
            .await?;

        // A payload-level failure (bad base64) has no outcome fields
        if !response.success && !response.data.contains_key("last_successful_batch") {
            return Err(Error::from_worker(
                response.error_kind,
                response.error.unwrap_or_default(),
            ));
        }
        response.into_outcome()
    }

    /// Last successful batch of this worker
    pub async fn get_checkpoint(&self) -> Result<WorkerBatchMarker> {
        let response = self.request(Request::GetCheckpoint).await?;
        Ok(response.into_data::<CheckpointData>()?.checkpoint)
    }

    /// Engine balance
    pub async fn get_balance(&self) -> Result<i64> {
        let response = self.request(Request::GetBalance).await?;
        Ok(response.into_data::<BalanceData>()?.balance)
    }

    /// Engine stake heights
    pub async fn get_stake_heights(&self) -> Result<Vec<u64>> {
        let response = self.request(Request::GetStakeHeights).await?;
        Ok(response.into_data::<StakeHeightsData>()?.stake_heights)
    }

    /// Engine transfers
    pub async fn get_transfers(&self, query: TransferQuery) -> Result<Transfers> {
        let response = self.request(Request::GetTransfers(query)).await?;
        response.into_data()
    }
}
