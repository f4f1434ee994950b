//! # Fleet Director Daemon
//!
//! Runs enrollment discovery, the push scheduler and command maintenance
//! against the configured downstream servers.
//!
//! ```text
//! fleet-director [--config <path>]
//!
//!   RUST_LOG           log filter (default: info)
//!   FLEET_*            configuration overrides, see DirectorConfig
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use fleet_db::{Database, DbConfig};
use fleet_sync::{DirectorAgent, DirectorConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How often the daemon logs a status summary.
const STATUS_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    let config_path = parse_args()?;
    let config = DirectorConfig::load(config_path).context("loading director configuration")?;

    let db_path = config.database_path();
    let db = Database::new(DbConfig::new(&db_path))
        .await
        .with_context(|| format!("opening database {}", db_path.display()))?;

    let mut agent = DirectorAgent::new(config, db.clone()).context("building director agent")?;
    agent.start().await?;

    let mut status_ticker = tokio::time::interval(STATUS_INTERVAL);
    status_ticker.tick().await;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = status_ticker.tick() => {
                let status = agent.status().await;
                match serde_json::to_string(&status) {
                    Ok(json) => info!(status = %json, "Director status"),
                    Err(err) => warn!(error = %err, "Could not encode director status"),
                }
            }
        }
    }

    agent.shutdown().await?;
    db.close().await;
    info!("Fleet director stopped");
    Ok(())
}

fn parse_args() -> anyhow::Result<Option<PathBuf>> {
    let mut args = std::env::args().skip(1);
    let mut config_path = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => match args.next() {
                Some(path) => config_path = Some(PathBuf::from(path)),
                None => bail!("--config requires a path"),
            },
            other => bail!("unknown argument: {}", other),
        }
    }

    Ok(config_path)
}

/// Resolves on Ctrl+C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
