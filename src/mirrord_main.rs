//! mirrord - beacon chain mirroring daemon
//!
//! Runs the head tracker, the deposit queue simulator and the blob archiver
//! against one beacon node, each on its own schedule, until Ctrl+C.

use anyhow::{Context, Result};
use beacon_mirror::blobs::BlobIndexer;
use beacon_mirror::config::ChainConfig;
use beacon_mirror::deposit_queue::DepositQueueIndexer;
use beacon_mirror::exporter::SlotExporter;
use beacon_mirror::head_tracker::HeadTracker;
use beacon_mirror::indexer::Indexer;
use beacon_mirror::rpc::{BeaconClient, NodeClient};
use beacon_mirror::schedule::{RetryPolicy, Scheduler};
use beacon_mirror::store::{ChainStore, RocksStore};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Beacon chain mirroring daemon
#[derive(Parser)]
#[command(name = "mirrord")]
#[command(about = "Mirror a beacon node into a local explorer database")]
struct Args {
    /// Beacon node REST endpoint
    #[arg(short, long, default_value = "http://127.0.0.1:5052")]
    node_url: String,

    /// Path to RocksDB database directory
    #[arg(short, long, default_value = "./mirror_db")]
    db_path: PathBuf,

    /// Chain config JSON (mainnet defaults when omitted)
    #[arg(short, long)]
    chain_config: Option<PathBuf>,

    /// Seconds between head tracker passes (defaults to one slot)
    #[arg(long)]
    head_interval_secs: Option<u64>,

    /// Longest the deposit queue snapshot may go without a recompute
    #[arg(long, default_value_t = 384)]
    queue_max_staleness_secs: u64,

    /// Longest an idle deposit queue pass waits before reporting liveness
    /// (keep below `mirrorctl health --max-age`)
    #[arg(long, default_value_t = 60)]
    queue_heartbeat_secs: u64,

    /// Seconds between blob archive passes
    #[arg(long, default_value_t = 60)]
    blob_interval_secs: u64,

    /// Slots per blob archive batch
    #[arg(long, default_value_t = 32)]
    batch_size: u64,

    /// Slots archived concurrently within a batch
    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    /// Per-request timeout for beacon node calls
    #[arg(long, default_value_t = 30)]
    request_timeout_secs: u64,
}

/// Run `indexer` under `policy` until the shutdown channel fires.
fn spawn_indexer<I>(
    tasks: &mut JoinSet<Result<&'static str>>,
    mut indexer: I,
    policy: RetryPolicy,
    store: Arc<dyn ChainStore>,
    mut shutdown: watch::Receiver<bool>,
) where
    I: Indexer + 'static,
{
    tasks.spawn(async move {
        let name = indexer.name();
        let scheduler = Scheduler::new(policy).with_liveness(store);
        let stop = async move {
            let _ = shutdown.changed().await;
        };
        let stats = scheduler.run(&mut indexer, stop).await?;
        info!("{} indexer stopped after {} passes ({} failed)", name, stats.passes, stats.failures);
        Ok(name)
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    info!("Starting beacon mirror");
    info!("Node URL: {}", args.node_url);
    info!("Database: {:?}", args.db_path);

    let node: Arc<dyn NodeClient> = Arc::new(BeaconClient::new(
        args.node_url.clone(),
        Duration::from_secs(args.request_timeout_secs),
    )?);

    // Waits out a node that is still starting; only a network mismatch is fatal
    let mut config = ChainConfig::load(args.chain_config.as_deref())?;
    config
        .sync_with_node(node.as_ref(), &RetryPolicy::default())
        .await?;
    info!("Following chain '{}'", config.config_name);

    let store = Arc::new(
        RocksStore::open(&args.db_path)
            .with_context(|| format!("Failed to open database at {:?}", args.db_path))?,
    );
    let queue_refresh = Arc::new(Notify::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    let exporter = SlotExporter::new(
        node.clone(),
        store.clone(),
        store.clone(),
        config.clone(),
        queue_refresh.clone(),
    );
    let head_interval = args.head_interval_secs.unwrap_or(config.seconds_per_slot);
    spawn_indexer(
        &mut tasks,
        HeadTracker::new(node.clone(), store.clone(), exporter, config.clone()),
        RetryPolicy {
            interval: Duration::from_secs(head_interval),
            ..RetryPolicy::default()
        },
        store.clone(),
        shutdown_rx.clone(),
    );

    // The queue indexer paces itself on the refresh signal
    spawn_indexer(
        &mut tasks,
        DepositQueueIndexer::new(
            node.clone(),
            store.clone(),
            config.clone(),
            queue_refresh,
            Duration::from_secs(args.queue_max_staleness_secs),
        )
        .with_heartbeat(Duration::from_secs(args.queue_heartbeat_secs)),
        RetryPolicy {
            interval: Duration::ZERO,
            ..RetryPolicy::default()
        },
        store.clone(),
        shutdown_rx.clone(),
    );

    spawn_indexer(
        &mut tasks,
        BlobIndexer::new(node, store.clone(), config, args.batch_size, args.concurrency),
        RetryPolicy {
            interval: Duration::from_secs(args.blob_interval_secs),
            ..RetryPolicy::default()
        },
        store.clone(),
        shutdown_rx,
    );

    let mut outcome = Ok(());
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
        Some(joined) = tasks.join_next() => {
            // An indexer only returns on its own after a fatal error
            match joined.context("Indexer task panicked")? {
                Ok(name) => info!("{} indexer exited", name),
                Err(e) => {
                    error!("Indexer failed: {:#}", e);
                    outcome = Err(e);
                }
            }
        }
    }

    let _ = shutdown_tx.send(true);
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined.context("Indexer task panicked")? {
            error!("Indexer failed during shutdown: {:#}", e);
        }
    }

    info!("Beacon mirror stopped");
    outcome
}
