//! flotilla - declarative bootstrap and upgrade tool for k0s clusters.
//!
//! Reads a cluster document, connects to every host over SSH, and drives
//! the phase pipeline that detects operating systems, gathers facts,
//! stages binaries, and rolls the upgrade through controllers and workers.

mod cluster;
mod config;
mod connection;
mod dryrun;
mod error;
mod manager;
mod os;
mod parallel;
mod phases;
mod retry;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use cluster::Cluster;
use config::{ExecutionConfig, RetryPolicy};
use connection::ssh::SshConnector;
use manager::PhaseManager;
use phases::PhaseContext;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    // Initialize logging. The guard flushes the file writer on exit.
    let (log_path, _guard) = match init_tracing() {
        Ok(v) => v,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            std::process::exit(1);
        }
    };

    info!("Starting flotilla v{VERSION}");
    info!("run log: {}", log_path.display());

    if let Err(e) = run().await {
        error!("Run failed: {e:#}");
        eprintln!("run failed, see log file for details: {}", log_path.display());
        std::process::exit(1);
    }
}

/// Initialize tracing: human-readable output on stderr filtered by
/// `RUST_LOG`, plus a full JSON debug log in a per-run file.
fn init_tracing() -> Result<(PathBuf, tracing_appender::non_blocking::WorkerGuard)> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, Layer, fmt};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| anyhow::anyhow!("Failed to initialize log filter: {e}"))?;

    let log_dir = std::env::temp_dir().join("flotilla-logs");
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("create log directory {}", log_dir.display()))?;
    let file_name = format!(
        "flotilla-{}.log",
        chrono::Utc::now().format("%Y%m%dT%H%M%SZ")
    );
    let log_path = log_dir.join(&file_name);

    let appender = tracing_appender::rolling::never(&log_dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_filter(filter))
        .with(fmt::layer().json().with_writer(writer))
        .init();

    Ok((log_path, guard))
}

async fn run() -> Result<()> {
    let path = std::env::args()
        .nth(1)
        .context("usage: flotilla <cluster.yaml>")?;
    let doc = std::fs::read_to_string(&path).with_context(|| format!("read {path}"))?;
    let cluster = Arc::new(Cluster::from_yaml(&doc).with_context(|| format!("parse {path}"))?);
    info!(
        "loaded cluster document with {} host(s), target version {}",
        cluster.hosts.len(),
        cluster.platform.version_trimmed()
    );

    let config = ExecutionConfig::from_env();
    if config.dry_run {
        info!("dry-run mode: no changes will be made");
    }
    let ctx = Arc::new(PhaseContext::new(
        config,
        RetryPolicy::default(),
        Arc::new(SshConnector::default()),
    ));

    let mut manager = PhaseManager::with_default_phases(cluster, ctx);
    manager.run().await?;

    if config.dry_run {
        let planned = manager.context().guard.planned();
        if planned.is_empty() {
            info!("dry-run: nothing to do");
        } else {
            info!("dry-run: {} action(s) would be taken:", planned.len());
            for action in planned {
                info!("  {}: {}", action.host, action.description);
            }
        }
    }

    Ok(())
}
