//! Dry-run guard for cluster-mutating actions.
//!
//! Every mutating primitive inside a phase goes through [`DryRunGuard::guard`]
//! so simulation mode is enforced in one place instead of per phase. In
//! dry-run mode the action is described and recorded but never invoked; in
//! normal ("wet") mode it runs and its result is returned unchanged.

use std::future::Future;
use std::sync::{Mutex, PoisonError};

use anyhow::Result;
use tracing::{debug, info};

use crate::cluster::Host;

/// One action that a dry run would have performed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedAction {
    pub host: String,
    pub description: String,
}

pub struct DryRunGuard {
    dry_run: bool,
    planned: Mutex<Vec<PlannedAction>>,
}

impl DryRunGuard {
    pub const fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            planned: Mutex::new(Vec::new()),
        }
    }

    /// True when mutating actions really execute.
    pub const fn is_wet(&self) -> bool {
        !self.dry_run
    }

    /// Execute `action` described by `description`, or record it in
    /// simulation mode.
    pub async fn guard<F, Fut>(&self, host: &Host, description: &str, action: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if self.dry_run {
            info!("{host}: dry-run: would {description}");
            self.planned
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(PlannedAction {
                    host: host.address.clone(),
                    description: description.to_string(),
                });
            return Ok(());
        }
        debug!("{host}: {description}");
        action().await
    }

    /// Actions recorded so far, in execution order.
    pub fn planned(&self) -> Vec<PlannedAction> {
        self.planned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Cluster;
    use anyhow::anyhow;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn host() -> Arc<Host> {
        Cluster::from_yaml(
            r"
hosts:
  - address: 10.0.0.9
    role: worker
platform:
  version: v1.30.2+k0s.0
",
        )
        .unwrap()
        .hosts
        .remove(0)
    }

    #[tokio::test]
    async fn test_dry_run_never_invokes_action() {
        let guard = DryRunGuard::new(true);
        let calls = AtomicUsize::new(0);
        let host = host();
        let result = guard
            .guard(&host, "stop k0s service", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow!("must not run")) }
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            guard.planned(),
            vec![PlannedAction {
                host: "10.0.0.9".into(),
                description: "stop k0s service".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_wet_mode_passes_result_through() {
        let guard = DryRunGuard::new(false);
        let host = host();
        assert!(guard.guard(&host, "noop", || async { Ok(()) }).await.is_ok());
        let err = guard
            .guard(&host, "noop", || async { Err(anyhow!("boom")) })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert!(guard.planned().is_empty());
        assert!(guard.is_wet());
    }
}
