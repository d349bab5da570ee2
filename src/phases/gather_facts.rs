//! Gather per-host facts: architecture and installed platform version.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use super::{Phase, PhaseContext};
use crate::cluster::{Cluster, Host};
use crate::parallel;

/// Map `uname -m` output to release artifact architecture names.
fn normalize_arch(machine: &str) -> String {
    match machine {
        "x86_64" | "amd64" => "amd64".to_string(),
        "aarch64" | "arm64" => "arm64".to_string(),
        "armv7l" | "armv8l" => "arm".to_string(),
        other => other.to_string(),
    }
}

/// Fills host metadata: normalized architecture, currently installed
/// platform version, and the needs-upgrade flag derived from comparing it
/// with the target version.
#[derive(Default)]
pub struct GatherFacts {
    hosts: Vec<Arc<Host>>,
    target_version: String,
    ctx: Option<Arc<PhaseContext>>,
}

#[async_trait]
impl Phase for GatherFacts {
    fn title(&self) -> &'static str {
        "Gather host facts"
    }

    async fn prepare(&mut self, cluster: &Arc<Cluster>, ctx: &Arc<PhaseContext>) -> Result<()> {
        self.hosts = cluster.hosts.clone();
        self.target_version = cluster.platform.version_trimmed().to_string();
        self.ctx = Some(Arc::clone(ctx));
        Ok(())
    }

    async fn run(&self) -> Result<()> {
        let ctx = self.ctx.as_ref().context("phase not prepared")?;
        let target = self.target_version.clone();
        parallel::for_each(&self.hosts, ctx.config.concurrency, move |host| {
            let target = target.clone();
            async move {
                let conn = host.connection()?;
                let capability = host.capability()?;

                let machine = conn
                    .exec_checked("uname -m", false)
                    .await
                    .with_context(|| format!("{host}: detect architecture"))?;
                let arch = normalize_arch(machine.trim());

                let binary = capability.binary_path();
                let current = if capability.file_exists(&*conn, binary).await {
                    let out = conn
                        .exec_checked(&format!("{binary} version"), false)
                        .await
                        .with_context(|| format!("{host}: query installed version"))?;
                    Some(out.trim().trim_start_matches('v').to_string())
                } else {
                    None
                };

                let needs_upgrade = current.as_deref() != Some(target.as_str());
                match &current {
                    Some(version) if needs_upgrade => {
                        info!("{host}: {arch}, running {version}, upgrade to {target} needed");
                    }
                    Some(version) => info!("{host}: {arch}, already at {version}"),
                    None => info!("{host}: {arch}, platform not installed"),
                }

                let mut meta = host.metadata();
                meta.arch = arch;
                meta.current_version = current;
                meta.needs_upgrade = needs_upgrade;
                Ok(())
            }
        })
        .await
    }
}
