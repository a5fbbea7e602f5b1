//! dirmirror daemon - continuous directory mirroring service
//!
//! This binary runs in the background (typically as a systemd user
//! service) and handles:
//! - Live mirroring of a source tree into a destination tree
//! - Optional timestamp-versioned history of every change
//! - Periodic reconciliation scans for changes the watcher missed
//! - Graceful shutdown on SIGTERM/SIGINT
//!
//! # Architecture
//!
//! The daemon loads and validates the YAML configuration, initializes
//! tracing, then hands control to [`MirrorEngine::run`]. The engine loop
//! is controlled by a `CancellationToken` that is triggered on receipt
//! of SIGTERM or SIGINT, so in-flight file operations finish or abort
//! cleanly before the process exits.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dirmirror_core::config::Config;
use dirmirror_sync::MirrorEngine;

// ============================================================================
// Command line
// ============================================================================

/// Continuous directory mirroring daemon
#[derive(Debug, Parser)]
#[command(name = "dirmirrord", version, about)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

// ============================================================================
// Tracing setup
// ============================================================================

/// Initializes the tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise the configured level applies.
/// With `logging.file` set, output goes to that file (ANSI disabled);
/// stderr otherwise.
fn init_tracing(config: &Config) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    match &config.logging.file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create log directory {}", parent.display())
                })?;
            }
            let file = std::fs::File::options()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .init();
        }
    }
    Ok(())
}

// ============================================================================
// Graceful shutdown signal handler
// ============================================================================

/// Waits for SIGTERM or SIGINT and triggers the cancellation token.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }

    token.cancel();
}

// ============================================================================
// Main entry point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(Config::default_path);

    let config = Config::load(&config_path).with_context(|| {
        format!(
            "failed to load configuration from {}",
            config_path.display()
        )
    })?;
    config.validate().context("invalid configuration")?;

    init_tracing(&config)?;
    info!(
        config_path = %config_path.display(),
        source = %config.source_root.display(),
        "dirmirror daemon starting (dirmirrord)"
    );

    // One token for every task; the signal handler cancels it.
    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal(signal_token).await;
    });

    let engine = MirrorEngine::new(Arc::new(config), shutdown.clone())?;
    let result = engine.run().await;

    match &result {
        Ok(()) => info!("dirmirror daemon shut down gracefully"),
        Err(e) => error!(error = %e, "dirmirror daemon exiting with error"),
    }

    result
}

// ============================================================================
// Tests
// ============================================================================
