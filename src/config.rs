//! Run-scoped execution settings.
//!
//! Both values are fixed before the phase manager starts and read-only for
//! the remainder of the run. There is no global mutable state; everything
//! travels down into phases through the [`crate::phases::PhaseContext`].

use std::time::Duration;

/// Default ceiling for concurrently managed hosts.
const DEFAULT_CONCURRENCY: usize = 30;

/// Default ceiling for concurrent binary downloads/uploads.
const DEFAULT_UPLOAD_CONCURRENCY: usize = 5;

/// Default overall deadline for a single retried operation.
const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(600);

/// Default pause between retry attempts.
const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Concurrency ceilings and run flags, set once per run.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionConfig {
    /// Maximum number of hosts worked on at the same time.
    pub concurrency: usize,
    /// Maximum number of simultaneous binary transfers.
    pub upload_concurrency: usize,
    /// Describe mutating actions instead of performing them.
    pub dry_run: bool,
    /// Skip post-upgrade cluster readiness polling.
    pub no_wait: bool,
    /// Downgrade leader readiness-check failures to warnings.
    pub force: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            upload_concurrency: DEFAULT_UPLOAD_CONCURRENCY,
            dry_run: false,
            no_wait: false,
            force: false,
        }
    }
}

impl ExecutionConfig {
    /// Build the config from `FLOTILLA_*` environment variables.
    ///
    /// Missing or unparsable variables fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            concurrency: env_usize("FLOTILLA_CONCURRENCY", defaults.concurrency),
            upload_concurrency: env_usize(
                "FLOTILLA_UPLOAD_CONCURRENCY",
                defaults.upload_concurrency,
            ),
            dry_run: env_flag("FLOTILLA_DRY_RUN"),
            no_wait: env_flag("FLOTILLA_NO_WAIT"),
            force: env_flag("FLOTILLA_FORCE"),
        }
    }
}

/// Deadline and pacing for the retry engine.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Overall deadline for one retried operation.
    pub timeout: Duration,
    /// Pause between attempts.
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_RETRY_TIMEOUT,
            interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn env_usize(name: &str, fallback: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(fallback)
}
