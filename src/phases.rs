//! Phase contract and the built-in phase implementations.
//!
//! A phase is one named, ordered unit of cluster-changing work. The manager
//! drives each phase through prepare / should_run / run / clean_up; phases
//! read and mutate the shared cluster model but never replace it.

pub mod connect;
pub mod detect_os;
pub mod disconnect;
pub mod download_binaries;
pub mod gather_facts;
mod upgrade;
pub mod upgrade_controllers;
pub mod upgrade_workers;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::cluster::Cluster;
use crate::config::{ExecutionConfig, RetryPolicy};
use crate::connection::Connector;
use crate::dryrun::DryRunGuard;

/// Run-wide collaborators handed to every phase during prepare.
pub struct PhaseContext {
    pub config: ExecutionConfig,
    pub retry: RetryPolicy,
    pub connector: Arc<dyn Connector>,
    pub guard: DryRunGuard,
}

impl PhaseContext {
    pub fn new(config: ExecutionConfig, retry: RetryPolicy, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            retry,
            connector,
            guard: DryRunGuard::new(config.dry_run),
        }
    }
}

/// Lifecycle implemented by every phase, consumed by the manager.
#[async_trait]
pub trait Phase: Send + Sync {
    fn title(&self) -> &'static str;

    /// Compute the phase's working host set against the current cluster.
    /// A failure here aborts the whole run.
    async fn prepare(&mut self, cluster: &Arc<Cluster>, ctx: &Arc<PhaseContext>) -> Result<()>;

    /// Whether run should be invoked at all. Defaults to true.
    fn should_run(&self) -> bool {
        true
    }

    async fn run(&self) -> Result<()>;

    /// Best-effort cleanup, invoked after run regardless of its outcome.
    /// Failures are logged by the phase itself, never propagated.
    async fn clean_up(&self) {}
}
