//! tierlink worker binary.
//!
//! Connects to the coordinator, authenticates, registers the local block
//! inventory and heartbeats until stopped.

use clap::Parser;
use tierlink_worker::config::WorkerConfig;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tierlink-worker", version)]
#[command(about = "Report a worker's block inventory to the tierlink coordinator")]
struct Cli {
    /// TOML configuration; `TIERLINK_*` variables override it.
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = WorkerConfig::load(cli.config.as_deref())?;
    info!(
        coordinator = %config.coordinator.transport,
        tiers = config.storage.tiers.len(),
        auth = config.auth.enabled,
        "tierlink worker starting"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    tierlink_worker::worker::run(config, shutdown).await?;
    info!("tierlink worker stopped");
    Ok(())
}

/// Cancels `shutdown` on Ctrl+C or, on unix, SIGTERM.
async fn cancel_on_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!(error = %e, "SIGTERM will not stop the worker");
            None
        }
    };

    #[cfg(unix)]
    let terminated = async {
        match sigterm.as_mut() {
            Some(stream) => {
                stream.recv().await;
            }
            None => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminated = std::future::pending::<()>();

    let interrupted = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Ctrl+C will not stop the worker");
            std::future::pending::<()>().await;
        }
    };

    let reason = tokio::select! {
        () = interrupted => "interrupt",
        () = terminated => "terminate",
    };
    info!(signal = reason, "shutting down");
    shutdown.cancel();
}
