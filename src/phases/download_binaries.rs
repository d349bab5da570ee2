//! Stage the target platform binary on hosts that need it.
//!
//! The binary is downloaded on the host itself, into the capability's
//! staging directory, and the staged path is recorded in host metadata for
//! the upgrade phases.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use super::{Phase, PhaseContext};
use crate::cluster::{Cluster, Host};
use crate::connection::quote;
use crate::parallel;

/// Release URL of the platform binary for one kind/arch pair.
fn download_url(version: &str, kind: &str, arch: &str) -> String {
    format!(
        "https://github.com/k0sproject/k0s/releases/download/v{version}/k0s-v{version}-{kind}-{arch}"
    )
}

/// Downloads the target binary to every host flagged needs-upgrade, bounded
/// by the upload concurrency ceiling.
#[derive(Default)]
pub struct DownloadBinaries {
    hosts: Vec<Arc<Host>>,
    version: String,
    ctx: Option<Arc<PhaseContext>>,
}

#[async_trait]
impl Phase for DownloadBinaries {
    fn title(&self) -> &'static str {
        "Download platform binaries"
    }

    async fn prepare(&mut self, cluster: &Arc<Cluster>, ctx: &Arc<PhaseContext>) -> Result<()> {
        self.hosts = cluster
            .hosts
            .iter()
            .filter(|h| h.metadata().needs_upgrade)
            .cloned()
            .collect();
        self.version = cluster.platform.version_trimmed().to_string();
        self.ctx = Some(Arc::clone(ctx));
        Ok(())
    }

    fn should_run(&self) -> bool {
        !self.hosts.is_empty()
    }

    async fn run(&self) -> Result<()> {
        let ctx = self.ctx.as_ref().context("phase not prepared")?;
        let version = self.version.clone();
        let ctx_for_hosts = Arc::clone(ctx);
        parallel::for_each(
            &self.hosts,
            ctx.config.upload_concurrency,
            move |host| {
                let ctx = Arc::clone(&ctx_for_hosts);
                let version = version.clone();
                async move {
                    let conn = host.connection()?;
                    let capability = host.capability()?;
                    let staging = capability.staging_dir();
                    let arch = host.metadata().arch.clone();

                    if !capability.file_exists(&*conn, staging).await {
                        ctx.guard
                            .guard(&host, &format!("create staging directory {staging}"), || async {
                                capability.mkdir(&*conn, staging).await
                            })
                            .await?;
                        ctx.guard
                            .guard(&host, &format!("set permissions of {staging} to 0755"), || async {
                                capability.chmod(&*conn, staging, "0755").await
                            })
                            .await?;
                    }

                    let url = download_url(&version, capability.kind(), &arch);
                    let dest = format!("{staging}/k0s-{version}-{arch}");
                    ctx.guard
                        .guard(&host, &format!("download {url}"), || async {
                            conn.exec_checked(
                                &format!("curl -sSLf -o {} -- {}", quote(&dest), quote(&url)),
                                true,
                            )
                            .await
                            .with_context(|| format!("{host}: download binary"))?;
                            Ok(())
                        })
                        .await?;

                    info!("{host}: staged {dest}");
                    host.metadata().pending_binary = Some(dest);
                    Ok(())
                }
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutionConfig, RetryPolicy};
    use crate::connection::mock::MockConnector;
    use crate::os::{OsIdentity, registry};

    #[test]
    fn test_download_url_format() {
        assert_eq!(
            download_url("1.30.2+k0s.0", "linux", "amd64"),
            "https://github.com/k0sproject/k0s/releases/download/v1.30.2+k0s.0/k0s-v1.30.2+k0s.0-linux-amd64"
        );
    }

    fn cluster() -> Arc<Cluster> {
        Arc::new(
            Cluster::from_yaml(
                r"
hosts:
  - address: 10.0.0.1
    role: controller
  - address: 10.0.0.2
    role: worker
platform:
  version: v1.30.2+k0s.0
",
            )
            .unwrap(),
        )
    }

    fn resolve(cluster: &Arc<Cluster>, connector: &Arc<MockConnector>) {
        let identity = OsIdentity {
            id: "ubuntu".into(),
            id_like: vec!["debian".into()],
            version: "24.04".into(),
            name: "Ubuntu".into(),
        };
        for host in &cluster.hosts {
            host.set_connection(connector.host(&host.address));
            host.set_resolved(identity.clone(), registry().resolve(&identity).unwrap());
            host.metadata().arch = "amd64".into();
        }
    }

    #[tokio::test]
    async fn test_downloads_only_on_hosts_needing_upgrade() {
        let cluster = cluster();
        let connector = Arc::new(MockConnector::new());
        resolve(&cluster, &connector);
        cluster.hosts[0].metadata().needs_upgrade = true;
        // Staging dir already present on the target host.
        connector.host("10.0.0.1").respond_status("test -e", 0);

        let ctx = Arc::new(PhaseContext::new(
            ExecutionConfig::default(),
            RetryPolicy::default(),
            connector.clone(),
        ));
        let mut phase = DownloadBinaries::default();
        phase.prepare(&cluster, &ctx).await.unwrap();
        assert!(phase.should_run());
        phase.run().await.unwrap();

        assert_eq!(connector.host("10.0.0.1").executed_containing("curl"), 1);
        assert_eq!(connector.host("10.0.0.2").executed_containing("curl"), 0);
        assert_eq!(
            cluster.hosts[0].metadata().pending_binary.as_deref(),
            Some("/tmp/flotilla/k0s-1.30.2+k0s.0-amd64")
        );
        assert!(cluster.hosts[1].metadata().pending_binary.is_none());
    }

    #[tokio::test]
    async fn test_skipped_when_no_host_needs_upgrade() {
        let cluster = cluster();
        let connector = Arc::new(MockConnector::new());
        resolve(&cluster, &connector);
        let ctx = Arc::new(PhaseContext::new(
            ExecutionConfig::default(),
            RetryPolicy::default(),
            connector,
        ));
        let mut phase = DownloadBinaries::default();
        phase.prepare(&cluster, &ctx).await.unwrap();
        assert!(!phase.should_run());
    }

    #[tokio::test]
    async fn test_dry_run_records_but_does_not_download() {
        let cluster = cluster();
        let connector = Arc::new(MockConnector::new());
        resolve(&cluster, &connector);
        cluster.hosts[0].metadata().needs_upgrade = true;
        connector.host("10.0.0.1").respond_status("test -e", 1);

        let config = ExecutionConfig {
            dry_run: true,
            ..ExecutionConfig::default()
        };
        let ctx = Arc::new(PhaseContext::new(
            config,
            RetryPolicy::default(),
            connector.clone(),
        ));
        let mut phase = DownloadBinaries::default();
        phase.prepare(&cluster, &ctx).await.unwrap();
        phase.run().await.unwrap();

        assert_eq!(connector.host("10.0.0.1").executed_containing("curl"), 0);
        assert_eq!(connector.host("10.0.0.1").executed_containing("mkdir"), 0);
        let planned = ctx.guard.planned();
        assert_eq!(planned.len(), 3);
        assert!(planned[2].description.starts_with("download https://"));
    }
}
