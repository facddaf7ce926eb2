//! sandgated — the sandgate daemon.
//!
//! Single binary that assembles the gateway:
//! - Access gate (JWT verification against a cached key set)
//! - Lifecycle supervisor + liveness watchdog
//! - Sync engine + periodic backup scheduler
//! - Reverse proxy (HTTP + WebSocket)
//!
//! # Usage
//!
//! ```text
//! sandgated serve --config /etc/sandgate/gateway.toml
//! sandgated check --config /etc/sandgate/gateway.toml
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sandgate_auth::{AccessGate, TokenLocator};
use sandgate_core::{GatewayConfig, StorageConfig, StorageKind};
use sandgate_proxy::{GatewayState, Upstream};
use sandgate_supervisor::Supervisor;
use sandgate_sync::{BackupScheduler, LocalDirStore, ObjectStore, S3Store, SyncEngine, SyncManifest};

const DEFAULT_FILTER: &str = "info,sandgated=debug,sandgate=debug";

#[derive(Parser)]
#[command(name = "sandgated", about = "sandgate gateway daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway.
    Serve {
        /// Path to the gateway config file.
        #[arg(long, env = "SANDGATE_CONFIG")]
        config: PathBuf,

        /// Override `server.listen`.
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
    /// Validate a config file and print the resolved settings.
    Check {
        /// Path to the gateway config file.
        #[arg(long, env = "SANDGATE_CONFIG")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Serve { config, listen } => run_serve(&config, listen).await,
        Command::Check { config } => run_check(&config),
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run_serve(config_path: &Path, listen: Option<SocketAddr>) -> anyhow::Result<()> {
    let mut config = GatewayConfig::from_file(config_path)?;
    if let Some(listen) = listen {
        config.server.listen = listen;
    }
    info!(config = %config_path.display(), "sandgate daemon starting");

    // ── Subsystems ─────────────────────────────────────────────

    let store = open_store(&config.storage).await?;
    let engine = Arc::new(SyncEngine::new(
        store,
        SyncManifest::from_config(&config.sync.entries),
    ));
    info!(entries = engine.manifest().len(), "sync engine initialized");

    let supervisor = Supervisor::from_config(&config.backend, Some(engine.clone()));
    info!(
        backend = %config.backend.address(),
        readiness = %config.backend.readiness_path,
        "lifecycle supervisor initialized"
    );

    let gate = Arc::new(AccessGate::from_config(&config.auth));
    let locator =
        Arc::new(TokenLocator::from_config(&config.auth).context("invalid auth.token_header")?);

    let state = GatewayState {
        gate,
        locator,
        supervisor: supervisor.clone(),
        sync: Some(engine.clone()),
        upstream: Upstream::new(config.backend.address()),
    };

    // ── Background tasks ───────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let watchdog_handle = {
        let supervisor = supervisor.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { supervisor.run_watchdog(shutdown).await })
    };

    let scheduler = BackupScheduler::new(engine, config.sync.interval, config.sync.tick_timeout);
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx));

    // ── Gateway ────────────────────────────────────────────────

    let router = sandgate_proxy::build_router(state);
    let addr = config.server.listen;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "gateway listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Stop the backend first so the final backup sees quiescent files.
    supervisor.shutdown().await;
    let _ = shutdown_tx.send(true);
    let _ = watchdog_handle.await;
    let _ = scheduler_handle.await;

    info!("sandgate daemon stopped");
    Ok(())
}

async fn open_store(storage: &StorageConfig) -> anyhow::Result<Arc<dyn ObjectStore>> {
    match storage.kind {
        StorageKind::S3 => {
            let bucket = storage
                .bucket
                .clone()
                .context("storage.bucket is required for kind = \"s3\"")?;
            info!(%bucket, endpoint = ?storage.endpoint, "using S3 object store");
            let store = S3Store::connect(
                bucket,
                storage.endpoint.as_deref(),
                storage.region.as_deref(),
            )
            .await;
            Ok(Arc::new(store))
        }
        StorageKind::Local => {
            let root = storage
                .root
                .clone()
                .context("storage.root is required for kind = \"local\"")?;
            info!(root = %root.display(), "using local directory object store");
            Ok(Arc::new(LocalDirStore::new(root)))
        }
    }
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

fn run_check(config_path: &Path) -> anyhow::Result<()> {
    let config = GatewayConfig::from_file(config_path)?;

    println!("config ok: {}", config_path.display());
    println!("  listen:   {}", config.server.listen);
    println!(
        "  auth:     {}",
        if config.auth.dev_bypass {
            "DEV BYPASS (no verification)".to_string()
        } else {
            config.auth.jwks_url.clone().unwrap_or_default()
        }
    );
    println!(
        "  backend:  {} ({})",
        config.backend.command.join(" "),
        config.backend.address()
    );
    println!("  storage:  {:?}", config.storage.kind);
    println!(
        "  sync:     every {}, {} entr{}",
        sandgate_core::duration::format_duration(config.sync.interval),
        config.sync.entries.len(),
        if config.sync.entries.len() == 1 { "y" } else { "ies" }
    );
    for entry in SyncManifest::from_config(&config.sync.entries).entries() {
        println!(
            "    {:<16} {} -> {}",
            entry.name,
            entry.local_dir.display(),
            entry.remote_prefix
        );
    }
    Ok(())
}
