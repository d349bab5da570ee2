//! Connect to every host in the cluster.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use super::{Phase, PhaseContext};
use crate::cluster::{Cluster, Host};
use crate::{parallel, retry};

/// Establishes a connection per host, retrying transient failures up to the
/// policy deadline. Structural failures (bad credentials, host key
/// mismatch) abort immediately through the typed error taxonomy.
#[derive(Default)]
pub struct Connect {
    hosts: Vec<Arc<Host>>,
    ctx: Option<Arc<PhaseContext>>,
}

#[async_trait]
impl Phase for Connect {
    fn title(&self) -> &'static str {
        "Connect to hosts"
    }

    async fn prepare(&mut self, cluster: &Arc<Cluster>, ctx: &Arc<PhaseContext>) -> Result<()> {
        self.hosts = cluster.hosts.clone();
        self.ctx = Some(Arc::clone(ctx));
        Ok(())
    }

    async fn run(&self) -> Result<()> {
        let ctx = self.ctx.as_ref().context("phase not prepared")?;
        let ctx_for_hosts = Arc::clone(ctx);
        parallel::for_each(&self.hosts, ctx.config.concurrency, move |host| {
            let ctx = Arc::clone(&ctx_for_hosts);
            async move {
                retry::with_policy(ctx.retry, || {
                    let ctx = Arc::clone(&ctx);
                    let host = Arc::clone(&host);
                    async move {
                        let conn = ctx.connector.connect(&host).await?;
                        conn.check_connection().await?;
                        host.set_connection(conn);
                        info!("{host}: connected");
                        Ok(())
                    }
                })
                .await
            }
        })
        .await
    }
}
