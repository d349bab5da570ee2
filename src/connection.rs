//! Remote command execution over a per-host connection.
//!
//! Phases never talk to a transport directly. They go through the
//! [`Connection`] trait, and connections are established lazily through a
//! [`Connector`]. The production implementation lives in [`ssh`]; tests use
//! a scripted in-memory connection.
//!
//! Transport failures are surfaced as typed [`ConnectionError`] kinds so the
//! retry engine can branch on a condition instead of error message text.

pub mod ssh;

use async_trait::async_trait;
use thiserror::Error;

/// Failure modes of the remote-execution collaborator.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("cannot connect to {host}: {reason}")]
    CannotConnect { host: String, reason: String },

    #[error("host key mismatch for {host}")]
    HostKeyMismatch { host: String },

    #[error("authentication failed for {host}")]
    AuthenticationFailed { host: String },

    #[error("command `{command}` exited with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("transport failure: {0}")]
    Transport(String),
}

impl ConnectionError {
    /// Returns true for structural failures that no amount of retrying can
    /// fix (bad credentials, host key changes, unresolvable targets).
    pub const fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::CannotConnect { .. }
                | Self::HostKeyMismatch { .. }
                | Self::AuthenticationFailed { .. }
        )
    }
}

/// Captured result of one remote command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub const fn success(&self) -> bool {
        self.status == 0
    }

    /// A successful, empty output.
    pub fn ok() -> Self {
        Self {
            status: 0,
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

/// An established channel to one host.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Address of the remote end, for logging.
    fn address(&self) -> &str;

    /// Run a shell command, optionally elevated, and capture its output.
    ///
    /// A non-zero exit status is not an error at this level; callers that
    /// require success use [`Connection::exec_checked`].
    async fn exec(&self, cmd: &str, sudo: bool) -> Result<CommandOutput, ConnectionError>;

    /// Cheap liveness probe of the channel.
    async fn check_connection(&self) -> Result<(), ConnectionError> {
        self.exec("true", false).await.map(|_| ())
    }

    /// Run a command and fail on a non-zero exit status, returning stdout.
    async fn exec_checked(&self, cmd: &str, sudo: bool) -> Result<String, ConnectionError> {
        let out = self.exec(cmd, sudo).await?;
        if out.success() {
            Ok(out.stdout)
        } else {
            Err(ConnectionError::CommandFailed {
                command: cmd.to_string(),
                status: out.status,
                stderr: out.stderr.trim().to_string(),
            })
        }
    }
}

/// Lazily establishes connections for hosts.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        host: &crate::cluster::Host,
    ) -> Result<std::sync::Arc<dyn Connection>, ConnectionError>;
}

/// Quote a string for safe interpolation into a `sh -c` command line.
pub fn quote(s: &str) -> String {
    if !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'/' | b'.' | b'-' | b'_' | b'=' | b':' | b'+')) {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}
