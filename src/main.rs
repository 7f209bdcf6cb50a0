//! Zipcode Gateway Server
//!
//! Epoch-based zipcode assignments and scoped S3 access for a
//! data-collection subnet

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use zipcode_gateway::chain::{CachedChainOracle, HttpMetagraphProvider, MetagraphCache};
use zipcode_gateway::config::Config;
use zipcode_gateway::limits::{MemoryCounter, RateLimiter};
use zipcode_gateway::s3::S3CredentialMinter;
use zipcode_gateway::selection::SelectionEngine;
use zipcode_gateway::server::{AppState, Monitor};
use zipcode_gateway::storage::AssignmentStore;
use zipcode_gateway::EpochScheduler;

#[derive(Parser)]
#[command(name = "zipcode-server", about = "Zipcode Gateway server")]
struct Args {
    /// Path to the configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,

    /// Override the configured listen port
    #[arg(long, env = "PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Zipcode Gateway Server");

    let args = Args::parse();
    let config = Config::load_from(&args.config)?;
    let port = args.port.unwrap_or(config.server.port);
    let secret = config.secret_key();

    let store = Arc::new(AssignmentStore::new(&config.database.path)?);
    info!("Storage initialized at {}", config.database.path);

    // Metagraph syncer feeding the cached verification path
    let provider = Arc::new(HttpMetagraphProvider::new(
        config.chain.metagraph_url.clone(),
        config.chain.netuid,
        Duration::from_secs(config.chain.signature_timeout_secs),
    )?);
    let metagraph = Arc::new(MetagraphCache::new(
        provider,
        Duration::from_secs(config.chain.sync_interval_secs),
    ));
    metagraph.initial_sync().await;
    let oracle = Arc::new(CachedChainOracle::new(metagraph.clone(), &config.chain));

    let engine = SelectionEngine::new(config.selection.clone(), secret);
    let scheduler = Arc::new(EpochScheduler::new(
        store.clone(),
        engine,
        config.epochs.clone(),
        config.selection.target_listings,
        config.selection.tolerance_percent,
    ));

    let (access_key, secret_key) = config.aws_credentials().unwrap_or_else(|| {
        warn!("AWS credentials not set, minted S3 credentials will not be honored");
        ("unset".to_string(), "unset".to_string())
    });
    let object_store = Arc::new(S3CredentialMinter::new(&config.s3, access_key, secret_key));

    let limits = Arc::new(RateLimiter::new(
        Arc::new(MemoryCounter::new()),
        config.limits.clone(),
    ));

    // One shutdown signal fans out to the supervisor, syncer and server
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(scheduler.clone().run(shutdown_rx.clone()));
    info!("Background epoch supervisor started");

    tokio::spawn(metagraph.clone().run(shutdown_rx.clone()));
    info!(
        "Metagraph syncer started for netuid {} (every {}s)",
        config.chain.netuid, config.chain.sync_interval_secs
    );

    let state = Arc::new(AppState {
        store,
        scheduler,
        oracle,
        limits,
        object_store,
        metagraph: Some(metagraph),
        config: config.clone(),
        started_at: Instant::now(),
        monitor: Monitor::default(),
    });

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    zipcode_gateway::server::run_server(&config.server.host, port, state, shutdown_rx).await?;

    Ok(())
}
