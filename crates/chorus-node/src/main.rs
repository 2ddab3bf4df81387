//! chorus-node: one chorus service instance.
//!
//! Wires the core together, runs the worker pool and housekeeping tasks, and
//! serves requests read as JSON lines on stdin. Replies are written as JSON
//! lines on stdout, interleaved with `invalidation` lines for the transport
//! that links this node to its peers.

mod inbound;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use chorus_core::config::Config;
use chorus_core::config_cache::{ConfigCache, ConfigService, ConfigWriter, InMemoryLayers, LayerSource};
use chorus_core::dedup::{DedupSettings, RequestDeduplicator};
use chorus_core::events::InvalidationBus;
use chorus_core::history::ContextEpochs;
use chorus_core::jobs::{ChannelQueue, JobResultStore, SqliteJobResults, WorkerPool, GENERATION_QUEUE};
use chorus_core::memory::InMemoryMemories;
use chorus_core::orchestrator::{Components, GenerationOrchestrator, OrchestratorSettings};
use chorus_core::providers::OpenAiCompatible;

use inbound::{invalidation_line, Node};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let project_root = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let config_path = project_root.join("config.yaml");
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            warn!("Using default config: {:#}", e);
            Config {
                project_root: project_root.clone(),
                ..Config::default()
            }
        }
    };

    let shutdown = CancellationToken::new();

    // Jobs
    let results: Arc<dyn JobResultStore> = Arc::new(
        SqliteJobResults::open(&config.data_path()).context("Failed to open job result store")?,
    );
    let queue = Arc::new(ChannelQueue::new());
    let provider = Arc::new(OpenAiCompatible::from_config(&config)?);
    let pool = WorkerPool::spawn(
        config.worker_count,
        queue.open(GENERATION_QUEUE),
        Arc::clone(&results),
        provider.clone(),
        shutdown.clone(),
    );

    // Config cascade + invalidation
    let bus = InvalidationBus::new(config.invalidation_capacity);
    let layers: Arc<dyn LayerSource> = Arc::new(InMemoryLayers::new());
    let cache = Arc::new(ConfigCache::new(config.config_cache_ttl()));
    let cache_task = cache.attach(&bus, shutdown.clone());

    // Dedup
    let dedup = RequestDeduplicator::new(DedupSettings {
        pending_ttl: config.dedup_ttl(),
        blackout: config.blackout(),
    });
    let sweeper = dedup.spawn_sweeper(
        tokio::time::interval(config.sweep_interval()),
        shutdown.clone(),
    );
    let cleaner = spawn_result_cleanup(Arc::clone(&results), &config, shutdown.clone());

    let orchestrator = GenerationOrchestrator::new(
        Components {
            dedup,
            configs: ConfigService::new(Arc::clone(&layers), cache),
            config_writer: ConfigWriter::new(layers, bus.clone(), config.invalidate_all_threshold),
            memories: Arc::new(InMemoryMemories::new()),
            embedder: provider,
            epochs: Arc::new(ContextEpochs::new()),
            queue,
            results,
        },
        OrchestratorSettings::from(&config),
    );

    info!(
        provider = %config.provider,
        model = %config.model,
        workers = pool.len(),
        data_dir = %config.data_path().display(),
        "chorus-node ready"
    );

    let node = Node::new(orchestrator, bus.clone());
    tokio::select! {
        result = serve_stdio(node, &bus, shutdown.child_token()) => {
            if let Err(e) = result {
                error!("stdin loop failed: {:#}", e);
            }
            info!("stdin closed");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    shutdown.cancel();
    pool.join().await;
    for task in [sweeper, cache_task, cleaner] {
        if let Err(e) = task.await {
            error!("background task panicked: {}", e);
        }
    }
    info!("chorus-node stopped.");
    Ok(())
}

/// Read requests line by line; each is handled in its own task so a slow
/// generation never blocks the next line. Local config invalidations are
/// written out alongside the replies.
async fn serve_stdio(node: Node, bus: &InvalidationBus, relay_stop: CancellationToken) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
            {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let relay_tx = tx.clone();
    let relay = bus.spawn_relay(
        move |wire| {
            let _ = relay_tx.send(invalidation_line(&wire));
        },
        relay_stop.clone(),
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut handlers = tokio::task::JoinSet::new();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        let node = node.clone();
        let tx = tx.clone();
        handlers.spawn(async move {
            let reply = node.dispatch(&line).await;
            let _ = tx.send(reply.to_string());
        });
    }

    while handlers.join_next().await.is_some() {}
    relay_stop.cancel();
    let _ = relay.await;
    drop(tx);
    let _ = writer.await;
    Ok(())
}

/// Purge delivered job results past retention and flag undelivered ones
/// that have been sitting around as long.
fn spawn_result_cleanup(
    results: Arc<dyn JobResultStore>,
    config: &Config,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let retention = config.job_retention();
    let mut ticker = tokio::time::interval(config.sweep_interval() * 6);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Ok(retention) = chrono::Duration::from_std(retention) else {
                break;
            };
            let before = chrono::Utc::now() - retention;
            match results.cleanup(before).await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "job results cleaned up"),
                Err(e) => warn!("job result cleanup failed: {}", e),
            }
            match results.undelivered_before(before).await {
                Ok(stuck) if !stuck.is_empty() => {
                    warn!(count = stuck.len(), oldest = %stuck[0].job_id, "undelivered job results past retention");
                }
                Ok(_) => {}
                Err(e) => warn!("undelivered scan failed: {}", e),
            }
        }
    })
}
