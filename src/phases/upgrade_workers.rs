//! Upgrade workers in parallel.
//!
//! Workers carry no control-plane state, so they are upgraded in batches
//! bounded by the configured concurrency. A worker is considered done once
//! its service reports running again; cluster-level checks stay with the
//! controller phase.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::warn;

use super::upgrade::{mark_upgraded, upgrade_host};
use super::{Phase, PhaseContext};
use crate::cluster::{Cluster, Host};
use crate::parallel;

#[derive(Default)]
pub struct UpgradeWorkers {
    hosts: Vec<Arc<Host>>,
    target_version: String,
    ctx: Option<Arc<PhaseContext>>,
}

#[async_trait]
impl Phase for UpgradeWorkers {
    fn title(&self) -> &'static str {
        "Upgrade workers"
    }

    async fn prepare(&mut self, cluster: &Arc<Cluster>, ctx: &Arc<PhaseContext>) -> Result<()> {
        self.hosts = cluster
            .workers()
            .into_iter()
            .filter(|h| {
                let meta = h.metadata();
                meta.needs_upgrade && meta.pending_binary.is_some()
            })
            .collect();
        self.target_version = cluster.platform.version_trimmed().to_string();
        self.ctx = Some(Arc::clone(ctx));
        Ok(())
    }

    fn should_run(&self) -> bool {
        !self.hosts.is_empty()
    }

    async fn run(&self) -> Result<()> {
        let ctx = self.ctx.as_ref().context("phase not prepared")?;
        let shared = Arc::clone(ctx);
        let target = self.target_version.clone();
        parallel::for_each(&self.hosts, ctx.config.concurrency, move |host| {
            let ctx = Arc::clone(&shared);
            let target = target.clone();
            async move {
                upgrade_host(&ctx, &host)
                    .await
                    .with_context(|| format!("{host}: upgrade failed"))?;
                if ctx.guard.is_wet() {
                    mark_upgraded(&host, &target);
                }
                Ok(())
            }
        })
        .await
    }

    async fn clean_up(&self) {
        for host in &self.hosts {
            if host.environment.is_empty() {
                continue;
            }
            let Ok(conn) = host.connection() else { continue };
            let Ok(capability) = host.capability() else {
                continue;
            };
            if let Err(err) = capability
                .cleanup_service_environment(&*conn, host.service_name())
                .await
            {
                warn!("{host}: failed to clean up service environment: {err:#}");
            }
        }
    }
}
