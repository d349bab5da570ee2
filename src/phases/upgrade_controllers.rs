//! Upgrade controllers one-by-one.
//!
//! Controllers are never upgraded in parallel: taking more than one
//! control-plane node down at a time risks quorum. After the last
//! controller, the leader is polled for scheduler activity and system pod
//! health unless the run is dry, `no_wait` is set, or `force` downgrades
//! those checks to warnings.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

use super::upgrade::{api_ready, mark_upgraded, scheduler_active, system_pods_running, upgrade_host};
use super::{Phase, PhaseContext};
use crate::cluster::{Cluster, Host};
use crate::retry;

pub struct UpgradeControllers {
    hosts: Vec<Arc<Host>>,
    leader: Option<Arc<Host>>,
    target_version: String,
    api_port: u16,
    ctx: Option<Arc<PhaseContext>>,
}

impl Default for UpgradeControllers {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            leader: None,
            target_version: String::new(),
            api_port: 6443,
            ctx: None,
        }
    }
}

#[async_trait]
impl Phase for UpgradeControllers {
    fn title(&self) -> &'static str {
        "Upgrade controllers"
    }

    async fn prepare(&mut self, cluster: &Arc<Cluster>, ctx: &Arc<PhaseContext>) -> Result<()> {
        self.hosts = cluster
            .controllers()
            .into_iter()
            .filter(|h| {
                let meta = h.metadata();
                meta.needs_upgrade && meta.pending_binary.is_some()
            })
            .collect();
        self.leader = Some(cluster.leader()?);
        self.target_version = cluster.platform.version_trimmed().to_string();
        self.api_port = cluster.platform.api_port();
        self.ctx = Some(Arc::clone(ctx));
        Ok(())
    }

    fn should_run(&self) -> bool {
        !self.hosts.is_empty()
    }

    async fn run(&self) -> Result<()> {
        let ctx = self.ctx.as_ref().context("phase not prepared")?;
        // Scheduler events from before this point are stale.
        let started = chrono::Utc::now();

        for host in &self.hosts {
            upgrade_host(ctx, host)
                .await
                .with_context(|| format!("{host}: upgrade failed"))?;

            if ctx.guard.is_wet() {
                let conn = host.connection()?;
                info!("{host}: waiting for the kube api to become ready");
                retry::with_policy(ctx.retry, || async {
                    api_ready(&*conn, self.api_port).await
                })
                .await
                .with_context(|| format!("{host}: kube api did not become ready"))?;
                mark_upgraded(host, &self.target_version);
            }
        }

        let leader = self.leader.as_ref().context("phase not prepared")?;
        if ctx.config.no_wait || !ctx.guard.is_wet() {
            warn!("{leader}: skipping scheduler and system pod checks");
            return Ok(());
        }

        let conn = leader.connection()?;
        let binary = leader.capability()?.binary_path();

        info!("{leader}: waiting for the scheduler to become ready");
        if let Err(err) = retry::with_policy(ctx.retry, || async {
            scheduler_active(&*conn, binary, started).await
        })
        .await
        {
            if ctx.config.force {
                warn!("{leader}: failed to observe scheduling events: {err:#}");
            } else {
                return Err(err.context(
                    "failed to observe scheduling events after api start-up, \
                     this check can be skipped with force",
                ));
            }
        }

        info!("{leader}: waiting for system pods to become ready");
        if let Err(err) = retry::with_policy(ctx.retry, || async {
            system_pods_running(&*conn, binary).await
        })
        .await
        {
            if ctx.config.force {
                warn!("{leader}: system pods not all running: {err:#}");
            } else {
                return Err(err.context(
                    "all system pods not running after api start-up, \
                     this check can be skipped with force",
                ));
            }
        }

        Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutionConfig, RetryPolicy};
    use crate::connection::mock::{MockConnection, MockConnector};
    use crate::os::{OsIdentity, registry};
    use std::time::Duration;

    const DOC: &str = r"
hosts:
  - address: 10.0.0.1
    role: controller
  - address: 10.0.0.2
    role: controller
  - address: 10.0.0.3
    role: worker
platform:
  version: v1.30.2+k0s.0
";

    fn identity() -> OsIdentity {
        OsIdentity {
            id: "ubuntu".into(),
            id_like: vec!["debian".into()],
            version: "24.04".into(),
            name: "Ubuntu".into(),
        }
    }

    fn wire(cluster: &Arc<Cluster>, connector: &Arc<MockConnector>) {
        for host in &cluster.hosts {
            host.set_connection(connector.host(&host.address));
            host.set_resolved(identity(), registry().resolve(&identity()).unwrap());
            host.metadata().arch = "amd64".into();
        }
    }

    fn healthy_after_upgrade(conn: &MockConnection) {
        // Staged binary present; the first is-active poll reports stopped,
        // later polls fall through to the default success (running). Api,
        // scheduler and system pods healthy.
        conn.respond_status("test -e", 0);
        conn.respond_status_once("is-active", 3);
        conn.respond_ok("http_code", "200");
        conn.respond_ok(
            "get events",
            r#"{"items":[{"reason":"Scheduled","lastTimestamp":"2099-01-01T00:00:00Z"}]}"#,
        );
        conn.respond_ok("get pods", r#"{"items":[{"status":{"phase":"Running"}}]}"#);
    }

    fn context(connector: Arc<MockConnector>, config: ExecutionConfig) -> Arc<PhaseContext> {
        let retry = RetryPolicy {
            timeout: Duration::from_millis(40),
            interval: Duration::from_millis(10),
        };
        Arc::new(PhaseContext::new(config, retry, connector))
    }

    #[tokio::test]
    async fn test_upgrades_only_flagged_controllers() {
        let cluster = Arc::new(Cluster::from_yaml(DOC).unwrap());
        let connector = Arc::new(MockConnector::new());
        wire(&cluster, &connector);
        {
            let mut meta = cluster.hosts[1].metadata();
            meta.needs_upgrade = true;
            meta.pending_binary = Some("/tmp/flotilla/k0s-1.30.2+k0s.0-amd64".into());
        }
        healthy_after_upgrade(&connector.host("10.0.0.2"));
        // Leader is untouched except for the post-upgrade cluster checks.
        let leader = connector.host("10.0.0.1");
        leader.respond_ok(
            "get events",
            r#"{"items":[{"reason":"Scheduled","lastTimestamp":"2099-01-01T00:00:00Z"}]}"#,
        );
        leader.respond_ok("get pods", r#"{"items":[{"status":{"phase":"Running"}}]}"#);

        let ctx = context(connector.clone(), ExecutionConfig::default());
        let mut phase = UpgradeControllers::default();
        phase.prepare(&cluster, &ctx).await.unwrap();
        assert!(phase.should_run());
        phase.run().await.unwrap();

        let upgraded = connector.host("10.0.0.2");
        assert_eq!(upgraded.executed_containing("systemctl stop k0scontroller"), 1);
        assert_eq!(upgraded.executed_containing("install -m 0755"), 1);
        assert_eq!(upgraded.executed_containing("systemctl start k0scontroller"), 1);
        // The other controller and the worker were never service-cycled.
        assert_eq!(leader.executed_containing("systemctl stop"), 0);
        assert_eq!(connector.host("10.0.0.3").executed_containing("systemctl"), 0);

        let meta = cluster.hosts[1].metadata();
        assert!(!meta.needs_upgrade);
        assert_eq!(meta.current_version.as_deref(), Some("1.30.2+k0s.0"));
        assert!(meta.pending_binary.is_none());
    }

    #[tokio::test]
    async fn test_should_run_false_when_nothing_to_upgrade() {
        let cluster = Arc::new(Cluster::from_yaml(DOC).unwrap());
        let connector = Arc::new(MockConnector::new());
        wire(&cluster, &connector);
        let ctx = context(connector, ExecutionConfig::default());
        let mut phase = UpgradeControllers::default();
        phase.prepare(&cluster, &ctx).await.unwrap();
        assert!(!phase.should_run());
    }

    #[tokio::test]
    async fn test_dry_run_records_steps_without_touching_the_host() {
        let cluster = Arc::new(Cluster::from_yaml(DOC).unwrap());
        let connector = Arc::new(MockConnector::new());
        wire(&cluster, &connector);
        {
            let mut meta = cluster.hosts[1].metadata();
            meta.needs_upgrade = true;
            meta.pending_binary = Some("/tmp/flotilla/k0s-1.30.2+k0s.0-amd64".into());
        }

        let config = ExecutionConfig {
            dry_run: true,
            ..ExecutionConfig::default()
        };
        let ctx = context(connector.clone(), config);
        let mut phase = UpgradeControllers::default();
        phase.prepare(&cluster, &ctx).await.unwrap();
        phase.run().await.unwrap();

        let target = connector.host("10.0.0.2");
        assert_eq!(target.executed_containing("systemctl"), 0);
        assert_eq!(target.executed_containing("install"), 0);
        let planned = ctx.guard.planned();
        assert!(planned.iter().any(|a| a.description == "stop k0scontroller service"));
        assert!(planned.iter().any(|a| a.description == "replace platform binary"));
        // Metadata untouched by a dry run.
        let meta = cluster.hosts[1].metadata();
        assert!(meta.needs_upgrade);
        assert!(meta.pending_binary.is_some());
    }

    #[tokio::test]
    async fn test_force_downgrades_leader_checks_to_warnings() {
        let cluster = Arc::new(Cluster::from_yaml(DOC).unwrap());
        let connector = Arc::new(MockConnector::new());
        wire(&cluster, &connector);
        {
            let mut meta = cluster.hosts[1].metadata();
            meta.needs_upgrade = true;
            meta.pending_binary = Some("/tmp/flotilla/k0s-1.30.2+k0s.0-amd64".into());
        }
        healthy_after_upgrade(&connector.host("10.0.0.2"));
        // Leader never reports scheduling events or pods.
        let leader = connector.host("10.0.0.1");
        leader.respond_ok("get events", r#"{"items":[]}"#);
        leader.respond_ok("get pods", r#"{"items":[]}"#);

        let without_force = context(connector.clone(), ExecutionConfig::default());
        let mut phase = UpgradeControllers::default();
        phase.prepare(&cluster, &without_force).await.unwrap();
        assert!(phase.run().await.is_err());

        // Re-stage the binary and the stop response for the second run.
        {
            let mut meta = cluster.hosts[1].metadata();
            meta.needs_upgrade = true;
            meta.pending_binary = Some("/tmp/flotilla/k0s-1.30.2+k0s.0-amd64".into());
        }
        connector.host("10.0.0.2").respond_status_once("is-active", 3);
        let with_force = context(
            connector.clone(),
            ExecutionConfig {
                force: true,
                ..ExecutionConfig::default()
            },
        );
        let mut phase = UpgradeControllers::default();
        phase.prepare(&cluster, &with_force).await.unwrap();
        phase.run().await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_removes_environment_overrides() {
        let cluster = Arc::new(
            Cluster::from_yaml(
                r"
hosts:
  - address: 10.0.0.1
    role: controller
    environment:
      HTTP_PROXY: http://proxy:3128
platform:
  version: v1.30.2+k0s.0
",
            )
            .unwrap(),
        );
        let connector = Arc::new(MockConnector::new());
        wire(&cluster, &connector);
        {
            let mut meta = cluster.hosts[0].metadata();
            meta.needs_upgrade = true;
            meta.pending_binary = Some("/tmp/flotilla/k0s".into());
        }
        let ctx = context(connector.clone(), ExecutionConfig::default());
        let mut phase = UpgradeControllers::default();
        phase.prepare(&cluster, &ctx).await.unwrap();
        phase.clean_up().await;
        assert_eq!(
            connector
                .host("10.0.0.1")
                .executed_containing("rm -f -- /etc/systemd/system/k0scontroller.service.d/flotilla.conf"),
            1
        );
    }
}
