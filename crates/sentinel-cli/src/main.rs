//! SentinelFS daemon CLI.
//!
//! Peer-to-peer file synchronisation over the LAN (and beyond, through a
//! relay): watches a directory tree, announces itself over UDP, and
//! broadcasts change notifications to authenticated peers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use sentinel_core::{
    DaemonConfig, EventBus, MemoryStore, Metrics, NetworkService, SessionManager, StorageGateway,
};
use sentinel_sync::{FileSyncDispatcher, IgnoreMatcher, PollWatcher};
use sentinel_transport::relay::RelayServer;

/// SentinelFS - peer-to-peer file synchronisation
#[derive(Parser)]
#[command(name = "sentinelfs")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log filter (overrides RUST_LOG)
    #[arg(long, default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync daemon
    Daemon {
        /// Configuration file path
        #[arg(short, long, default_value = "sentinelfs.toml")]
        config: PathBuf,

        /// Override the watch root from the config
        #[arg(long)]
        watch_root: Option<PathBuf>,

        /// Override the session code from the config
        #[arg(long)]
        session_code: Option<String>,
    },

    /// Write a default configuration file
    InitConfig {
        /// Output path
        #[arg(short, long, default_value = "sentinelfs.toml")]
        output: PathBuf,
    },

    /// Run a rendezvous relay server
    RelayServer {
        /// Bind address
        #[arg(short, long, default_value = "0.0.0.0:9471")]
        bind: String,
    },

    /// Scan the watch root once and print a summary
    Scan {
        /// Directory to scan
        #[arg(default_value = ".")]
        root: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log)),
        )
        .init();

    match cli.command {
        Commands::Daemon {
            config,
            watch_root,
            session_code,
        } => run_daemon(config, watch_root, session_code).await,
        Commands::InitConfig { output } => init_config(&output),
        Commands::RelayServer { bind } => run_relay_server(&bind).await,
        Commands::Scan { root } => run_scan(root).await,
    }
}

async fn run_daemon(
    config_path: PathBuf,
    watch_root: Option<PathBuf>,
    session_code: Option<String>,
) -> anyhow::Result<()> {
    let mut config = if config_path.exists() {
        DaemonConfig::load(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?
    } else {
        info!(path = %config_path.display(), "no config file, using defaults");
        DaemonConfig::default()
    };
    if let Some(root) = watch_root {
        config.watch_root = root;
    }
    if let Some(code) = session_code {
        config.session_code = code;
    }
    config.validate()?;

    let peer_id = sentinel_crypto::random::peer_identifier();
    info!(peer_id, root = %config.watch_root.display(), "starting daemon");

    let session = Arc::new(SessionManager::new(&peer_id));
    let storage = Arc::new(MemoryStore::new());
    let bus = EventBus::new();
    let metrics = Arc::new(Metrics::new());

    let watch_root = config.watch_root.clone();
    let sync_enabled = config.sync_enabled;
    let network = Arc::new(NetworkService::new(
        config,
        session,
        storage.clone(),
        bus,
        metrics.clone(),
    ));
    network.start().await.context("starting network service")?;

    let dispatcher = FileSyncDispatcher::new(network.clone(), watch_root.clone(), sync_enabled);
    let scan = dispatcher.initial_scan();
    info!(
        scanned = scan.scanned,
        ignored = scan.ignored,
        "initial scan complete"
    );
    let _catchup = dispatcher.clone().start_catchup();

    // Portable polling producer; native watcher adapters replace this.
    let patterns = storage.ignore_patterns().unwrap_or_default();
    let watcher = PollWatcher::new(
        watch_root,
        Duration::from_secs(2),
        IgnoreMatcher::new(patterns),
    );
    let (tx, rx) = tokio::sync::mpsc::channel(256);
    let watcher_task = watcher.spawn(tx);
    let dispatcher_task = tokio::spawn(dispatcher.clone().run(rx));

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");

    watcher.stop();
    watcher_task.abort();
    dispatcher_task.abort();
    network.shutdown().await;

    let snapshot = metrics.snapshot();
    info!(
        files_synced = snapshot.files_synced,
        bytes_sent = snapshot.bytes_sent,
        bytes_received = snapshot.bytes_received,
        "final statistics"
    );
    Ok(())
}

fn init_config(output: &PathBuf) -> anyhow::Result<()> {
    if output.exists() {
        anyhow::bail!("{} already exists", output.display());
    }
    let config = DaemonConfig::default();
    std::fs::write(output, config.to_toml())
        .with_context(|| format!("writing {}", output.display()))?;
    println!("wrote {}", output.display());
    Ok(())
}

async fn run_relay_server(bind: &str) -> anyhow::Result<()> {
    let server = Arc::new(
        RelayServer::bind(bind)
            .await
            .with_context(|| format!("binding relay server on {bind}"))?,
    );
    info!(port = server.local_port(), "relay server running");

    let runner = server.clone();
    let task = tokio::spawn(async move {
        runner.run().await;
    });

    tokio::signal::ctrl_c().await.ok();
    server.shutdown();
    let _ = task.await;
    Ok(())
}

async fn run_scan(root: PathBuf) -> anyhow::Result<()> {
    let root = root.canonicalize().context("resolving scan root")?;
    let peer_id = sentinel_crypto::random::peer_identifier();
    let session = Arc::new(SessionManager::new(&peer_id));
    let storage = Arc::new(MemoryStore::new());

    let config = DaemonConfig {
        watch_root: root.clone(),
        ..Default::default()
    };
    let network = Arc::new(NetworkService::new(
        config,
        session,
        storage.clone(),
        EventBus::new(),
        Arc::new(Metrics::new()),
    ));

    let dispatcher = FileSyncDispatcher::new(network, root.clone(), false);
    let summary = dispatcher.initial_scan();

    println!(
        "{}: {} files recorded, {} ignored, {} errors",
        root.display(),
        summary.scanned,
        summary.ignored,
        summary.errors
    );
    for file in storage.files_in(&root).unwrap_or_default() {
        println!(
            "  {}  {}  {} bytes",
            &file.hash[..16],
            file.path.display(),
            file.size
        );
    }
    Ok(())
}
