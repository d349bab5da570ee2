//! Remote operating system detection.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use super::{Phase, PhaseContext};
use crate::cluster::{Cluster, Host};
use crate::os::{self, parse_os_release};
use crate::parallel;

const OS_RELEASE_CMD: &str = "cat /etc/os-release || cat /usr/lib/os-release";

/// Reads `/etc/os-release` on every host, resolves a capability through the
/// registry, and tallies hosts per detected OS. An identity no registered
/// family matches is a permanent failure.
#[derive(Default)]
pub struct DetectOs {
    hosts: Vec<Arc<Host>>,
    ctx: Option<Arc<PhaseContext>>,
    os_counts: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl DetectOs {
    /// Hosts per detected OS, for reporting.
    pub fn os_counts(&self) -> BTreeMap<String, usize> {
        self.os_counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Phase for DetectOs {
    fn title(&self) -> &'static str {
        "Detect host operating systems"
    }

    async fn prepare(&mut self, cluster: &Arc<Cluster>, ctx: &Arc<PhaseContext>) -> Result<()> {
        self.hosts = cluster.hosts.clone();
        self.ctx = Some(Arc::clone(ctx));
        Ok(())
    }

    async fn run(&self) -> Result<()> {
        let ctx = self.ctx.as_ref().context("phase not prepared")?;
        let counts = Arc::clone(&self.os_counts);
        parallel::for_each(&self.hosts, ctx.config.concurrency, move |host| {
            let counts = Arc::clone(&counts);
            async move {
                let conn = host.connection()?;
                let raw = conn
                    .exec_checked(OS_RELEASE_CMD, false)
                    .await
                    .with_context(|| format!("{host}: read os-release"))?;
                let mut identity = parse_os_release(&raw)?;
                if let Some(id) = &host.os_override {
                    info!("{host}: OS ID has been manually set to {id}");
                    identity.id.clone_from(id);
                }
                let capability = os::registry().resolve(&identity)?;
                info!("{host}: is running {identity}");
                *counts
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .entry(identity.to_string())
                    .or_default() += 1;
                host.set_resolved(identity, capability);
                Ok(())
            }
        })
        .await?;

        for (identity, count) in self.os_counts() {
            info!("{count} host(s) running {identity}");
        }
        Ok(())
    }
}
