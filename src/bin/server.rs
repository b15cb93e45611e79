//! LedgerKV Server Binary
//!
//! Opens the engine, starts the raft node and serves clients.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::Parser;
use ledgerkv::api::{ClusterApi, StoreApi};
use ledgerkv::consensus::start_node;
use ledgerkv::network::Server;
use ledgerkv::{Config, Engine};
use tracing_subscriber::{fmt, EnvFilter};

/// LedgerKV Server
#[derive(Parser, Debug)]
#[command(name = "ledgerkv-server")]
#[command(about = "Replicated key-value store node")]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Start a new single-node cluster (only on a node without raft state)
    #[arg(long)]
    bootstrap: bool,

    /// Client listen address (overrides the config file)
    #[arg(long)]
    server_bind: Option<String>,

    /// Raft listen address (overrides the config file)
    #[arg(long)]
    raft_bind: Option<String>,

    /// Data directory (overrides the config file)
    #[arg(short, long)]
    volume: Option<PathBuf>,

    /// Raft node id (overrides the config file)
    #[arg(long)]
    node_id: Option<u64>,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,ledgerkv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    tracing::info!("LedgerKV Server v{}", ledgerkv::VERSION);

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    tracing::info!("Volume: {}", config.volume.display());
    tracing::info!("Client address: {}", config.server_bind);
    tracing::info!("Raft address: {}", config.raft_bind);

    let engine = match Engine::open(config.clone()) {
        Ok(e) => Arc::new(e),
        Err(e) => {
            tracing::error!("Failed to open engine: {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!("Engine initialized successfully");

    let server = match Server::bind(&config) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("Failed to bind client listener: {}", e);
            std::process::exit(1);
        }
    };

    let api_addr = server.local_addr().to_string();
    let node = match start_node(&config, Arc::clone(&engine), &api_addr, args.bootstrap) {
        Ok(node) => node,
        Err(e) => {
            tracing::error!("Failed to start raft node: {}", e);
            std::process::exit(1);
        }
    };

    match node.handle().stats() {
        Ok(stats) => match serde_json::to_string_pretty(&stats) {
            Ok(json) => tracing::info!("Node stats:\n{}", json),
            Err(e) => tracing::warn!("Cannot render node stats: {}", e),
        },
        Err(e) => tracing::warn!("Cannot read node stats: {}", e),
    }

    let shutdown = server.shutdown_flag();
    if let Err(e) = ctrlc::set_handler(move || {
        tracing::info!("Received Ctrl+C, initiating shutdown...");
        shutdown.store(true, Ordering::SeqCst);
    }) {
        tracing::warn!("Cannot install Ctrl+C handler: {}", e);
    }

    let handle = node.handle();
    if let Err(e) = server.run(StoreApi::new(handle.clone()), ClusterApi::new(handle)) {
        tracing::error!("Server error: {}", e);
        node.shutdown();
        std::process::exit(1);
    }

    node.shutdown();
    if let Err(e) = engine.flush() {
        tracing::warn!("Final flush failed: {}", e);
    }

    tracing::info!("Server stopped");
}

fn load_config(args: &Args) -> ledgerkv::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    if let Some(addr) = &args.server_bind {
        config.server_bind = addr.clone();
    }
    if let Some(addr) = &args.raft_bind {
        config.raft_bind = addr.clone();
    }
    if let Some(volume) = &args.volume {
        config.volume = volume.clone();
    }
    if let Some(id) = args.node_id {
        config.node_id = Some(id);
    }

    config.validate()?;
    Ok(config)
}
