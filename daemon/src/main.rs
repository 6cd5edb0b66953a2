//! everarch gateway daemon
//!
//! Serves the `evr` claim archive to WebSocket clients.

use anyhow::Result;
use clap::Parser;
use evr_gateway_daemon::{metrics, DaemonConfig, Gateway, SessionContext};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// everarch gateway - WebSocket access to an evr archive
#[derive(Parser, Debug)]
#[command(name = "evr-gatewayd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "gateway.toml")]
    config: PathBuf,

    /// Run in verbose mode
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging, RUST_LOG wins over --verbose
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if args.verbose { "debug" } else { "info" }));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("everarch gateway v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = DaemonConfig::load(&args.config).await?;
    info!(
        "Loaded configuration from {} (archive tool {})",
        args.config.display(),
        config.archive.program.display()
    );

    let context = SessionContext::from_config(&config);
    if context.users.is_empty() {
        warn!("No users configured, every authentication will fail");
    } else {
        info!("{} users configured", context.users.len());
    }

    // Start metrics server
    let metrics_handle = metrics::start_server(&config.monitoring);

    let gateway = Gateway::bind(config.bind_addr(), context).await?;
    gateway
        .serve_until(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl-C, shutting down"),
                Err(e) => {
                    error!("Failed to listen for Ctrl-C: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        })
        .await?;

    // Cleanup
    metrics_handle.abort();

    Ok(())
}
