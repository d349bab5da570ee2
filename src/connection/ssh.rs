//! SSH-backed connection using the system OpenSSH client via `openssh`.
//!
//! This is a thin adapter: connection multiplexing, authentication, and
//! command streaming belong to the transport. The adapter's job is to
//! translate transport failures into typed [`ConnectionError`] kinds so the
//! rest of the engine never inspects error message text.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use openssh::{KnownHosts, Session, SessionBuilder};

use super::{CommandOutput, Connection, ConnectionError, Connector};
use crate::cluster::Host;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Establishes [`SshConnection`]s for hosts on demand.
#[derive(Debug, Clone, Copy)]
pub struct SshConnector {
    connect_timeout: Duration,
}

impl Default for SshConnector {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, host: &Host) -> Result<Arc<dyn Connection>, ConnectionError> {
        let mut builder = SessionBuilder::default();
        builder.user(host.user.clone());
        builder.port(host.port);
        builder.connect_timeout(self.connect_timeout);
        builder.known_hosts_check(KnownHosts::Strict);
        if let Some(key) = &host.key_path {
            builder.keyfile(key);
        }
        let session = builder
            .connect(&host.address)
            .await
            .map_err(|err| classify(&host.address, &err))?;
        Ok(Arc::new(SshConnection {
            address: host.address.clone(),
            session,
        }))
    }
}

/// One multiplexed SSH session to a host.
pub struct SshConnection {
    address: String,
    session: Session,
}

#[async_trait]
impl Connection for SshConnection {
    fn address(&self) -> &str {
        &self.address
    }

    async fn exec(&self, cmd: &str, sudo: bool) -> Result<CommandOutput, ConnectionError> {
        let output = if sudo {
            self.session
                .command("sudo")
                .arg("-n")
                .arg("--")
                .arg("sh")
                .arg("-c")
                .arg(cmd)
                .output()
                .await
        } else {
            self.session
                .command("sh")
                .arg("-c")
                .arg(cmd)
                .output()
                .await
        }
        .map_err(|err| classify(&self.address, &err))?;

        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Map an `openssh` failure onto the typed taxonomy.
///
/// The ssh client reports structural failures only through its diagnostics,
/// so this is the single place where message text is inspected. Everything
/// past this boundary branches on the typed kind.
fn classify(host: &str, err: &openssh::Error) -> ConnectionError {
    let msg = err.to_string();
    if msg.contains("Permission denied") || msg.contains("Too many authentication failures") {
        return ConnectionError::AuthenticationFailed {
            host: host.to_string(),
        };
    }
    if msg.contains("Host key verification failed")
        || msg.contains("IDENTIFICATION HAS CHANGED")
    {
        return ConnectionError::HostKeyMismatch {
            host: host.to_string(),
        };
    }
    if msg.contains("Could not resolve hostname") || msg.contains("Name or service not known") {
        return ConnectionError::CannotConnect {
            host: host.to_string(),
            reason: msg,
        };
    }
    ConnectionError::Transport(msg)
}
