//! llmsnap - model snapping for local inference servers
//!
//! Serves many logical models behind one OpenAI-compatible endpoint,
//! starting, sleeping, waking and stopping backend processes so GPU memory
//! is shared among more models than could be co-resident.

use anyhow::{Context, Result};
use clap::Parser;
use llmsnap::{Config, StopMode};
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "llmsnap")]
#[command(about = "OpenAI-compatible proxy with process sleep/wake orchestration")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Backend process output is logged under the "upstream" target at debug
    // level, so it can be enabled with e.g. RUST_LOG=info,upstream=debug.
    let filter = if args.verbose {
        EnvFilter::new("llmsnap=debug,upstream=debug,tower_http=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("starting llmsnap");

    let mut config = Config::from_file(&args.config)
        .await
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;

    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    let mut model_ids: Vec<_> = config.models.keys().cloned().collect();
    model_ids.sort();
    info!(models = ?model_ids, listen = %config.listen, "configuration loaded");

    let listen = config.listen.clone();
    let (app, scheduler) = llmsnap::build_app(config)
        .await
        .context("failed to build application")?;

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to bind to {listen}"))?;

    info!(addr = %listen, "listening for requests");

    let shutdown_scheduler = scheduler.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Kill every child before exiting so nothing keeps holding GPU memory.
    shutdown_scheduler.stop_all(StopMode::Immediate).await;
    shutdown_scheduler.shutdown_all().await;

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}
