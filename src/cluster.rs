//! Cluster and host data model.
//!
//! The [`Cluster`] is owned by the phase manager for the duration of a run.
//! Hosts persist across the whole run and are progressively enriched: the
//! connect phase fills the connection handle, OS detection fills identity
//! and capability, later phases fill upgrade metadata.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::connection::Connection;
use crate::os::{Capability, OsIdentity};

/// Declared role of a host in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum HostRole {
    #[serde(rename = "controller")]
    Controller,
    #[serde(rename = "worker")]
    Worker,
    #[serde(rename = "controller+worker")]
    ControllerWorker,
}

impl HostRole {
    pub const fn is_controller(self) -> bool {
        matches!(self, Self::Controller | Self::ControllerWorker)
    }

    pub const fn is_worker(self) -> bool {
        matches!(self, Self::Worker | Self::ControllerWorker)
    }

    /// Name of the platform service this role runs.
    pub const fn service_name(self) -> &'static str {
        match self {
            Self::Controller | Self::ControllerWorker => "k0scontroller",
            Self::Worker => "k0sworker",
        }
    }
}

impl std::fmt::Display for HostRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Controller => write!(f, "controller"),
            Self::Worker => write!(f, "worker"),
            Self::ControllerWorker => write!(f, "controller+worker"),
        }
    }
}

/// Mutable per-host state filled in by phases.
#[derive(Debug, Clone, Default)]
pub struct HostMetadata {
    /// Normalized machine architecture ("amd64", "arm64", ...).
    pub arch: String,
    /// Platform version currently installed on the host, if any.
    pub current_version: Option<String>,
    /// Whether the host must be brought to the target version.
    pub needs_upgrade: bool,
    /// Remote path of the staged binary awaiting installation.
    pub pending_binary: Option<String>,
}

/// OS identity and capability, resolved together exactly once.
#[derive(Clone)]
pub struct ResolvedOs {
    pub identity: OsIdentity,
    pub capability: Arc<dyn Capability>,
}

fn default_port() -> u16 {
    22
}

fn default_user() -> String {
    "root".to_string()
}

/// One fleet member. Identity fields are immutable after construction;
/// runtime state lives behind interior mutability so per-host workers can
/// enrich their own host without cross-host locking.
#[derive(Deserialize)]
pub struct Host {
    /// Network address used for the remote-shell transport.
    pub address: String,
    pub role: HostRole,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default, rename = "keyPath")]
    pub key_path: Option<String>,
    /// Manual OS identifier, replacing the ID detected from os-release.
    #[serde(default, rename = "osIDOverride")]
    pub os_override: Option<String>,
    /// Extra environment for the platform service on this host.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    #[serde(skip)]
    connection: RwLock<Option<Arc<dyn Connection>>>,
    #[serde(skip)]
    resolved: OnceLock<ResolvedOs>,
    #[serde(skip)]
    metadata: Mutex<HostMetadata>,
}

impl Host {
    pub fn service_name(&self) -> &'static str {
        self.role.service_name()
    }

    /// The established connection, or an error when the connect phase has
    /// not run for this host yet.
    pub fn connection(&self) -> Result<Arc<dyn Connection>> {
        self.connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .with_context(|| format!("{self}: not connected"))
    }

    pub fn set_connection(&self, conn: Arc<dyn Connection>) {
        *self
            .connection
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(conn);
    }

    pub fn disconnect(&self) {
        *self
            .connection
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Record the detected OS identity together with its capability.
    ///
    /// The two are set atomically and only once, so a capability handle
    /// exists if and only if the identity has been resolved.
    pub fn set_resolved(&self, identity: OsIdentity, capability: Arc<dyn Capability>) {
        let _ = self.resolved.set(ResolvedOs {
            identity,
            capability,
        });
    }

    pub fn os(&self) -> Option<&OsIdentity> {
        self.resolved.get().map(|r| &r.identity)
    }

    pub fn capability(&self) -> Result<Arc<dyn Capability>> {
        self.resolved
            .get()
            .map(|r| Arc::clone(&r.capability))
            .with_context(|| format!("{self}: operating system not detected"))
    }

    pub fn metadata(&self) -> MutexGuard<'_, HostMetadata> {
        self.metadata.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Display for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address)
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("address", &self.address)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

/// Orchestrated platform settings: target version plus the raw config
/// document handed to the platform itself.
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformConfig {
    pub version: String,
    #[serde(default)]
    pub config: serde_yaml::Value,
}

impl PlatformConfig {
    /// API port from the raw config (`spec.api.port`), default 6443.
    pub fn api_port(&self) -> u16 {
        self.config
            .get("spec")
            .and_then(|v| v.get("api"))
            .and_then(|v| v.get("port"))
            .and_then(serde_yaml::Value::as_u64)
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(6443)
    }

    /// Target version without a leading `v`.
    pub fn version_trimmed(&self) -> &str {
        self.version.trim_start_matches('v')
    }
}

#[derive(Deserialize)]
struct ClusterDoc {
    hosts: Vec<Host>,
    platform: PlatformConfig,
}

/// Root aggregate handed to every phase.
pub struct Cluster {
    pub hosts: Vec<Arc<Host>>,
    pub platform: PlatformConfig,
}

impl Cluster {
    pub fn new(hosts: Vec<Host>, platform: PlatformConfig) -> Self {
        Self {
            hosts: hosts.into_iter().map(Arc::new).collect(),
            platform,
        }
    }

    /// Parse an already-validated cluster document.
    pub fn from_yaml(doc: &str) -> Result<Self> {
        let doc: ClusterDoc =
            serde_yaml::from_str(doc).context("failed to parse cluster document")?;
        Ok(Self::new(doc.hosts, doc.platform))
    }

    pub fn controllers(&self) -> Vec<Arc<Host>> {
        self.hosts
            .iter()
            .filter(|h| h.role.is_controller())
            .cloned()
            .collect()
    }

    pub fn workers(&self) -> Vec<Arc<Host>> {
        self.hosts
            .iter()
            .filter(|h| h.role.is_worker())
            .cloned()
            .collect()
    }

    /// The control-plane leader used for cluster-wide readiness checks:
    /// the first declared controller.
    pub fn leader(&self) -> Result<Arc<Host>> {
        self.hosts
            .iter()
            .find(|h| h.role.is_controller())
            .cloned()
            .ok_or_else(|| crate::error::FlotillaError::NoLeader.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r"
hosts:
  - address: 10.0.0.1
    role: controller
    user: ops
  - address: 10.0.0.2
    role: controller+worker
  - address: 10.0.0.3
    role: worker
    port: 2222
platform:
  version: v1.30.2+k0s.0
  config:
    spec:
      api:
        port: 9443
";

    #[test]
    fn test_from_yaml() {
        let cluster = Cluster::from_yaml(DOC).unwrap();
        assert_eq!(cluster.hosts.len(), 3);
        assert_eq!(cluster.hosts[0].user, "ops");
        assert_eq!(cluster.hosts[1].user, "root");
        assert_eq!(cluster.hosts[2].port, 2222);
        assert_eq!(cluster.platform.api_port(), 9443);
        assert_eq!(cluster.platform.version_trimmed(), "1.30.2+k0s.0");
    }

    #[test]
    fn test_role_selectors() {
        let cluster = Cluster::from_yaml(DOC).unwrap();
        assert_eq!(cluster.controllers().len(), 2);
        assert_eq!(cluster.workers().len(), 2);
        assert_eq!(cluster.leader().unwrap().address, "10.0.0.1");
    }

    #[test]
    fn test_service_names() {
        assert_eq!(HostRole::Controller.service_name(), "k0scontroller");
        assert_eq!(HostRole::ControllerWorker.service_name(), "k0scontroller");
        assert_eq!(HostRole::Worker.service_name(), "k0sworker");
    }

    #[test]
    fn test_api_port_default() {
        let platform = PlatformConfig {
            version: "v1.30.2+k0s.0".into(),
            config: serde_yaml::Value::Null,
        };
        assert_eq!(platform.api_port(), 6443);
    }

    #[test]
    fn test_leader_requires_a_controller() {
        let cluster = Cluster::from_yaml(
            r"
hosts:
  - address: 10.0.0.3
    role: worker
platform:
  version: v1.30.2+k0s.0
",
        )
        .unwrap();
        assert!(cluster.leader().is_err());
    }

    #[test]
    fn test_resolved_invariant() {
        let cluster = Cluster::from_yaml(DOC).unwrap();
        let host = &cluster.hosts[0];
        assert!(host.os().is_none());
        assert!(host.capability().is_err());

        host.set_resolved(
            crate::os::OsIdentity {
                id: "ubuntu".into(),
                id_like: vec!["debian".into()],
                version: "24.04".into(),
                name: "Ubuntu".into(),
            },
            crate::os::registry()
                .resolve(&crate::os::OsIdentity {
                    id: "ubuntu".into(),
                    id_like: vec!["debian".into()],
                    version: "24.04".into(),
                    name: "Ubuntu".into(),
                })
                .unwrap(),
        );
        assert!(host.os().is_some());
        assert!(host.capability().is_ok());
    }
}
