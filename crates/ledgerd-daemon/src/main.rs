//! ledgerd - automated bookkeeping daemon.
//!
//! Boots the store and the supervised worker set, serves the card callback
//! webhook, and handles process signals: SIGTERM/SIGINT drain the workers
//! within the grace period, SIGHUP reloads the configuration file and the
//! workers pick up the new snapshot at their next idle point.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use ledgerd_core::config::LedgerConfig;
use ledgerd_daemon::daemon::MasterDaemon;
use ledgerd_daemon::services::{Connectors, build};
use ledgerd_daemon::webhook;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// ledgerd daemon - supervised bookkeeping pipeline
#[derive(Parser, Debug)]
#[command(name = "ledgerd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "ledgerd.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Listen address for the callback webhook
    #[arg(long, default_value = "127.0.0.1:8710")]
    listen: std::net::SocketAddr,

    /// Disable the webhook listener
    #[arg(long)]
    no_webhook: bool,
}

fn load_config(path: &PathBuf) -> Result<LedgerConfig> {
    if path.exists() {
        Ok(LedgerConfig::from_file(path)?)
    } else {
        warn!(path = %path.display(), "configuration file missing; using defaults");
        let mut config = LedgerConfig::default();
        config.apply_env_overrides(std::env::vars());
        Ok(config)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;
    runtime.block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<()> {
    let config = load_config(&args.config)?;
    info!(store = %config.paths.store_file.display(), "ledgerd starting");

    let services = build(&config, Connectors::default())?;
    let mut daemon = MasterDaemon::new(std::sync::Arc::clone(&services), config)?;
    daemon.start().await?;

    if !args.no_webhook {
        let router = webhook::router(std::sync::Arc::clone(&services.hub));
        let listener = tokio::net::TcpListener::bind(args.listen)
            .await
            .with_context(|| format!("bind webhook listener on {}", args.listen))?;
        info!(listen = %args.listen, "webhook listener up");
        let cancel = daemon.cancel_token();
        tokio::spawn(async move {
            let shutdown = async move { cancel.cancelled().await };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(error = %e, "webhook listener failed");
            }
        });
    }

    // Signals: TERM/INT cancel the root token; HUP feeds a reloaded
    // configuration into the supervision loop.
    let cancel = daemon.cancel_token();
    let (reload_tx, reload_rx) = tokio::sync::mpsc::channel(4);
    let config_path = args.config.clone();
    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        let mut sighup = signal(SignalKind::hangup()).expect("install SIGHUP handler");
        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("SIGTERM received");
                    cancel.cancel();
                }
                _ = sigint.recv() => {
                    info!("SIGINT received");
                    cancel.cancel();
                }
                _ = sighup.recv() => {
                    match load_config(&config_path) {
                        Ok(reloaded) => {
                            let _ = reload_tx.send(reloaded).await;
                        }
                        Err(e) => {
                            error!(error = %e, "configuration reload failed; keeping current");
                        }
                    }
                }
            }
        }
    });

    daemon.run(reload_rx).await?;
    daemon.shutdown().await;
    Ok(())
}
