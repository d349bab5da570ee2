//! Close all host connections at the end of a run.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use super::{Phase, PhaseContext};
use crate::cluster::{Cluster, Host};

#[derive(Default)]
pub struct Disconnect {
    hosts: Vec<Arc<Host>>,
}

#[async_trait]
impl Phase for Disconnect {
    fn title(&self) -> &'static str {
        "Disconnect from hosts"
    }

    async fn prepare(&mut self, cluster: &Arc<Cluster>, _ctx: &Arc<PhaseContext>) -> Result<()> {
        self.hosts = cluster.hosts.clone();
        Ok(())
    }

    async fn run(&self) -> Result<()> {
        for host in &self.hosts {
            if host.is_connected() {
                debug!("{host}: disconnecting");
                host.disconnect();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutionConfig, RetryPolicy};
    use crate::connection::mock::MockConnector;

    #[tokio::test]
    async fn test_disconnects_every_host() {
        let cluster = Arc::new(
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
        );
        let connector = Arc::new(MockConnector::new());
        for host in &cluster.hosts {
            host.set_connection(connector.host(&host.address));
        }
        let ctx = Arc::new(PhaseContext::new(
            ExecutionConfig::default(),
            RetryPolicy::default(),
            connector,
        ));
        let mut phase = Disconnect::default();
        phase.prepare(&cluster, &ctx).await.unwrap();
        phase.run().await.unwrap();
        assert!(cluster.hosts.iter().all(|h| !h.is_connected()));
    }
}
