//! Retry loop with a deadline and an abort escape hatch.
//!
//! Most remote operations during convergence are idempotent polls where
//! transient failures are expected and absorbed. A subset of failures is
//! definitively unrecoverable (rejected credentials, host key changes,
//! unsupported OS) and must fail fast instead of burning the deadline.
//! Those are signalled either explicitly with [`abort`] or implicitly by a
//! permanent typed error anywhere in the chain.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use crate::config::RetryPolicy;
use crate::connection::ConnectionError;
use crate::error::FlotillaError;

/// Marker meaning "do not retry this operation; it cannot succeed".
#[derive(Debug, Clone, Copy, Error)]
#[error("operation cannot succeed, not retrying")]
pub struct Abort;

/// Marker carried by the error returned on deadline expiry. The last
/// observed cause remains in the chain underneath it.
#[derive(Debug, Clone, Copy, Error)]
#[error("deadline of {0:?} exceeded")]
pub struct DeadlineExceeded(pub Duration);

/// Wrap an error so the retry loop gives up immediately.
pub fn abort(err: anyhow::Error) -> anyhow::Error {
    err.context(Abort)
}

fn is_abort(err: &anyhow::Error) -> bool {
    // The marker is attached as anyhow context, which lives outside the
    // std source chain; only Error::downcast_ref sees context values.
    err.downcast_ref::<Abort>().is_some()
        || err.chain().any(|cause| {
            cause
                .downcast_ref::<ConnectionError>()
                .is_some_and(ConnectionError::is_permanent)
                || cause
                    .downcast_ref::<FlotillaError>()
                    .is_some_and(FlotillaError::is_permanent)
        })
}

/// Invoke `op` at `interval` pacing until it succeeds, signals an abort, or
/// `deadline` elapses. On expiry the returned error wraps the last observed
/// cause with a [`DeadlineExceeded`] marker.
pub async fn timeout<F, Fut>(deadline: Duration, interval: Duration, mut op: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let started = Instant::now();
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let last_err = match op().await {
            Ok(()) => return Ok(()),
            Err(err) if is_abort(&err) => return Err(err),
            Err(err) => err,
        };
        debug!("attempt {attempt} failed: {last_err:#}");
        if started.elapsed() + interval > deadline {
            return Err(last_err.context(DeadlineExceeded(deadline)));
        }
        tokio::time::sleep(interval).await;
    }
}

/// [`timeout`] with the deadline and interval of a [`RetryPolicy`].
pub async fn with_policy<F, Fut>(policy: RetryPolicy, op: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    timeout(policy.timeout, policy.interval, op).await
}
