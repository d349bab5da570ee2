//! Bounded fan-out of a per-host operation.
//!
//! The executor schedules at most `limit` invocations at a time. When one
//! invocation fails, in-flight work is allowed to drain (cancelling it
//! could leave a host half-mutated) but nothing new is scheduled, and the
//! first failure by completion order is returned. Later failures are logged
//! and dropped.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tracing::warn;

/// Run `op` for every item with at most `limit` concurrently active
/// invocations. `limit == 0` means unbounded.
pub async fn for_each<T, F, Fut>(items: &[Arc<T>], limit: usize, op: F) -> Result<()>
where
    T: Send + Sync + 'static,
    F: Fn(Arc<T>) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let limit = if limit == 0 { items.len().max(1) } else { limit };
    let mut queue = items.iter().cloned();
    let mut tasks: JoinSet<Result<()>> = JoinSet::new();
    let mut first_err: Option<anyhow::Error> = None;

    loop {
        while first_err.is_none() && tasks.len() < limit {
            match queue.next() {
                Some(item) => {
                    tasks.spawn(op(item));
                }
                None => break,
            }
        }
        match tasks.join_next().await {
            None => break,
            Some(Ok(Ok(()))) => {}
            Some(Ok(Err(err))) => {
                if first_err.is_none() {
                    first_err = Some(err);
                } else {
                    warn!("additional failure in batch: {err:#}");
                }
            }
            Some(Err(join_err)) => {
                let err = anyhow::Error::new(join_err).context("host worker panicked");
                if first_err.is_none() {
                    first_err = Some(err);
                } else {
                    warn!("additional failure in batch: {err:#}");
                }
            }
        }
    }

    match first_err {
        Some(err) => Err(err).context("parallel execution failed"),
        None => Ok(()),
    }
}
