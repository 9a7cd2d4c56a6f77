//! CLI scan harness for exercising the scan journal
//!
//! Runs sessions against the simulated chain and engine so that
//! interrupt/resume, gap filling and checkpoint behaviour can be observed
//! on a real database file:
//! - Full and partial scans with injected fetch failures
//! - Interrupting a scan after N chunks and resuming it
//! - Inspecting journals, gaps and checkpoints
//! - Clean slate and vault-restore anchoring

use anyhow::Context;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use scan_storage_sqlite::{JournalConfig, ScanJournal};
use scan_sync::sim::{SimulatedChain, SimulatedEngineFactory};
use scan_sync::{
    spawn_worker, BatchConfig, ChunkSource, RecoveryValidator, ScanConfig, ScanCoordinator,
    ScanRequest, WorkerConfig,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_SEED_HEX: &str = "0707070707070707070707070707070707070707070707070707070707070707";

#[derive(Parser)]
#[command(name = "scan-harness")]
#[command(about = "Resumable wallet scan testing harness", long_about = None)]
struct Cli {
    /// Journal database file
    #[arg(short, long, global = true, default_value = "scan-journal.db")]
    db: PathBuf,

    /// JSON harness configuration
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a height range against the simulated chain
    Scan {
        /// Wallet seed (hex)
        #[arg(long, default_value = DEFAULT_SEED_HEX)]
        seed: String,

        /// First height
        #[arg(short, long, default_value = "0")]
        start: u64,

        /// End height (exclusive)
        #[arg(short, long, default_value = "100000")]
        end: u64,

        /// Number of workers (overrides the config file)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Pay the wallet every N chunks
        #[arg(long, default_value = "10")]
        match_every: u64,

        /// Chunks whose first fetch fails
        #[arg(long)]
        fail_chunk: Vec<u64>,

        /// Chunks served with tampered data
        #[arg(long)]
        tamper_chunk: Vec<u64>,

        /// Cancel after N chunks
        #[arg(long)]
        interrupt_after: Option<u64>,
    },

    /// Show journals, checkpoint and resume plan of a wallet
    Status {
        /// Wallet address
        wallet: String,

        /// End height to plan a resume for
        #[arg(short, long, default_value = "100000")]
        end: u64,
    },

    /// Show the recovery verdict for a wallet
    Gaps {
        /// Wallet address
        wallet: String,

        /// End height
        #[arg(short, long, default_value = "100000")]
        end: u64,
    },

    /// Erase all scan state of a wallet
    CleanSlate {
        /// Wallet address
        wallet: String,
    },

    /// Anchor a wallet restored from a vault
    RestoreCheckpoint {
        /// Wallet address
        wallet: String,

        /// Height the vault was scanned to
        #[arg(long)]
        height: u64,
    },
}

/// Harness configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct HarnessConfig {
    scan: ScanConfig,
    batch: BatchConfig,
    workers: usize,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            scan: ScanConfig::default(),
            batch: BatchConfig::default(),
            workers: 1,
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<HarnessConfig> {
    let Some(path) = path else {
        return Ok(HarnessConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let journal = ScanJournal::open(
        &cli.db,
        JournalConfig {
            chunk_size: config.scan.chunk_size,
        },
    )
    .with_context(|| format!("opening journal {}", cli.db.display()))?;

    match cli.command {
        Commands::Scan {
            seed,
            start,
            end,
            workers,
            match_every,
            fail_chunk,
            tamper_chunk,
            interrupt_after,
        } => {
            let options = ScanOptions {
                seed,
                start,
                end,
                workers: workers.unwrap_or(config.workers),
                match_every,
                fail_chunks: fail_chunk,
                tamper_chunks: tamper_chunk,
                interrupt_after,
            };
            run_scan(journal, config, options).await?;
        }
        Commands::Status { wallet, end } => {
            run_status(journal, &config, &wallet, end).await?;
        }
        Commands::Gaps { wallet, end } => {
            let validator = RecoveryValidator::new(journal, config.scan.recovery);
            let verdict = validator
                .is_recovery_safe(&wallet, end, config.scan.chunk_size)
                .await?;
            println!("{}", serde_json::to_string_pretty(&verdict)?);
        }
        Commands::CleanSlate { wallet } => {
            let removed = journal.force_clean_slate(&wallet).await?;
            info!("Removed {} journals for {}", removed, wallet);
        }
        Commands::RestoreCheckpoint { wallet, height } => {
            journal
                .populate_checkpoint_from_vault_restore(&wallet, height, config.scan.chunk_size)
                .await?;
            let checkpoint = journal.get_checkpoint(&wallet).await?;
            println!("{}", serde_json::to_string_pretty(&checkpoint)?);
        }
    }

    Ok(())
}

struct ScanOptions {
    seed: String,
    start: u64,
    end: u64,
    workers: usize,
    match_every: u64,
    fail_chunks: Vec<u64>,
    tamper_chunks: Vec<u64>,
    interrupt_after: Option<u64>,
}

async fn run_scan(
    journal: ScanJournal,
    config: HarnessConfig,
    options: ScanOptions,
) -> anyhow::Result<()> {
    let factory = Arc::new(SimulatedEngineFactory::new());
    let mut workers = Vec::with_capacity(options.workers.max(1));
    let mut address = String::new();

    for i in 0..options.workers.max(1) {
        let worker = spawn_worker(
            factory.clone(),
            WorkerConfig {
                name: format!("scan-worker-{}", i),
                batch: config.batch.clone(),
                ..Default::default()
            },
        )?;
        address = worker.init(&options.seed, "", None).await?;
        workers.push(worker);
    }
    info!("Scanning for {} with {} workers", address, workers.len());

    let chain = Arc::new(SimulatedChain::new(&address).with_match_every(options.match_every));
    for chunk in &options.fail_chunks {
        chain.fail_fetch(*chunk, 1);
    }
    for chunk in &options.tamper_chunks {
        chain.tamper(*chunk);
    }

    let source: Arc<dyn ChunkSource> = chain;
    let scanner = ScanCoordinator::new(journal, source, workers, config.scan)?;

    // Progress bar
    let progress = scanner.progress();
    let cancel = scanner.cancel_token();
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {percent}% {msg}")?
            .progress_chars("=>-"),
    );

    let pb_clone = pb.clone();
    let interrupt_after = options.interrupt_after;
    let progress_task = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(200)).await;

            pb_clone.set_position(progress.percentage() as u64);
            pb_clone.set_message(progress.summary());

            if let Some(limit) = interrupt_after {
                if progress.chunks_done() >= limit && !cancel.is_cancelled() {
                    warn!("Interrupting scan after {} chunks", progress.chunks_done());
                    cancel.cancel();
                }
            }
        }
    });

    let result = scanner
        .run(ScanRequest {
            wallet_address: address,
            start_height: options.start,
            end_height: options.end,
            scan_id: None,
        })
        .await;

    progress_task.abort();

    match result {
        Ok(report) => {
            pb.finish_with_message(scanner.progress().summary());
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.completed_journal {
                warn!(
                    "Scan {} left incomplete; run again to resume",
                    report.scan_id
                );
            }
            Ok(())
        }
        Err(e) => {
            pb.abandon_with_message("Scan aborted");
            warn!("Scan failed: {}", e);
            Err(e.into())
        }
    }
}

async fn run_status(
    journal: ScanJournal,
    config: &HarnessConfig,
    wallet: &str,
    end: u64,
) -> anyhow::Result<()> {
    let journals = journal.list_journals(wallet).await?;
    if journals.is_empty() {
        info!("No scan journals for {}", wallet);
    }
    for entry in &journals {
        info!(
            "{} [{}, {}) phase={} scanned={} in_progress={} txs={} errors={}",
            entry.scan_id,
            entry.start_height,
            entry.target_end_height,
            entry.phase.as_str(),
            entry.scanned_chunks.len(),
            entry.in_progress_chunks.len(),
            entry.transactions_found,
            entry.error_count
        );
        for error in journal.recent_errors(&entry.scan_id, 3).await? {
            info!("  error at {}: {}", error.created_at, error.message);
        }
    }

    match journal.get_checkpoint(wallet).await? {
        Some(checkpoint) => info!(
            "Checkpoint: completed={} balance={} at {}",
            checkpoint.last_completed_height,
            checkpoint.balance_at_checkpoint,
            checkpoint.height_at_checkpoint
        ),
        None => info!("No checkpoint"),
    }

    let validator = RecoveryValidator::new(journal, config.scan.recovery);
    let interruption = validator.was_interrupted(wallet).await?;
    let plan = validator
        .validate_and_resume(wallet, end, config.scan.chunk_size)
        .await?;

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "interruption": interruption,
            "resume_plan": plan,
        }))?
    );

    Ok(())
}
