use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ratewarden::config::RatewardenConfig;
use ratewarden::http::{GuardState, HttpServer};
use ratewarden::ratelimit::{LimitPolicy, RateLimiter};
use ratewarden::store::ConfiguredStore;

/// Per-identity request throttling service.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "RATEWARDEN_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    if args.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Ratewarden");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = RatewardenConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    info!(
        listen_addr = %config.server.listen_addr,
        ip_limit = config.limits.ip_limit,
        token_limit = config.limits.token_limit,
        block_duration = ?config.limits.block_duration,
        "Configuration loaded"
    );

    // Initialize the counter store
    let storage = ConfiguredStore::from_config(&config.storage).await?;

    let policy = LimitPolicy::from(config.limits.clone());
    let limiter = Arc::new(RateLimiter::new(Arc::clone(&storage.store), policy));
    info!("Rate limiter initialized");

    let shutdown = CancellationToken::new();
    let state = GuardState::new(limiter, &config.server, shutdown.clone())?;
    let server = HttpServer::new(config.server.listen_addr, state);

    // Run the server with graceful shutdown on Ctrl+C
    let result = server.serve_with_shutdown(shutdown_signal()).await;

    shutdown.cancel();
    storage.shutdown().await;

    result?;
    info!("Ratewarden stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
