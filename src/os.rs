//! OS detection, capability contract, and family dispatch.
//!
//! Each supported family registers a `(predicate, factory)` pair in the
//! process-wide [`Registry`], built once at startup. Resolution scans in
//! reverse registration order so a family registered later deliberately
//! specializes a more generic one (e.g. Alpine over generic Linux). Phases
//! stay OS-agnostic by invoking operations through the [`Capability`] trait.

pub mod linux;

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use anyhow::Result;
use async_trait::async_trait;

use crate::connection::Connection;
use crate::error::FlotillaError;

/// Identity parsed from `/etc/os-release`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsIdentity {
    pub id: String,
    pub id_like: Vec<String>,
    pub version: String,
    pub name: String,
}

impl OsIdentity {
    pub fn id_like_contains(&self, family: &str) -> bool {
        self.id_like.iter().any(|l| l == family)
    }
}

impl std::fmt::Display for OsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.name.is_empty() {
            write!(f, "{} {}", self.id, self.version)
        } else {
            write!(f, "{} {}", self.name, self.version)
        }
    }
}

/// Parse the `KEY=value` lines of an os-release document.
pub fn parse_os_release(text: &str) -> Result<OsIdentity> {
    let mut fields: BTreeMap<&str, String> = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            fields.insert(key.trim(), value.trim().trim_matches('"').to_string());
        }
    }
    let id = fields
        .remove("ID")
        .ok_or_else(|| FlotillaError::InvalidClusterConfig("os-release has no ID field".into()))?;
    Ok(OsIdentity {
        id,
        id_like: fields
            .remove("ID_LIKE")
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default(),
        version: fields.remove("VERSION_ID").unwrap_or_default(),
        name: fields.remove("NAME").unwrap_or_default(),
    })
}

/// OS-family-specific primitives a phase can invoke on a host.
#[async_trait]
pub trait Capability: std::fmt::Debug + Send + Sync {
    /// Stable identifier used in remote download URLs and logging.
    fn kind(&self) -> &'static str;

    /// Install location of the platform binary.
    fn binary_path(&self) -> &'static str {
        "/usr/local/bin/k0s"
    }

    /// Directory for staging downloaded artifacts.
    fn staging_dir(&self) -> &'static str {
        "/tmp/flotilla"
    }

    async fn file_exists(&self, conn: &dyn Connection, path: &str) -> bool;
    async fn mkdir(&self, conn: &dyn Connection, path: &str) -> Result<()>;
    async fn chmod(&self, conn: &dyn Connection, path: &str, perm: &str) -> Result<()>;
    async fn chown(&self, conn: &dyn Connection, path: &str, owner: &str) -> Result<()>;

    /// Move a staged binary into place with executable permissions.
    async fn install_binary(&self, conn: &dyn Connection, src: &str, dest: &str) -> Result<()>;

    async fn start_service(&self, conn: &dyn Connection, service: &str) -> Result<()>;
    async fn stop_service(&self, conn: &dyn Connection, service: &str) -> Result<()>;
    async fn service_is_running(&self, conn: &dyn Connection, service: &str) -> Result<bool>;

    /// Write environment overrides consumed by the named service.
    async fn update_service_environment(
        &self,
        conn: &dyn Connection,
        service: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Remove environment overrides written by
    /// [`Capability::update_service_environment`].
    async fn cleanup_service_environment(
        &self,
        conn: &dyn Connection,
        service: &str,
    ) -> Result<()>;
}

type Predicate = fn(&OsIdentity) -> bool;
type Factory = fn() -> Arc<dyn Capability>;

/// Append-only table mapping detection predicates to capability factories.
#[derive(Default)]
pub struct Registry {
    entries: Vec<(Predicate, Factory)>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, predicate: Predicate, factory: Factory) {
        self.entries.push((predicate, factory));
    }

    /// Find the capability for an identity. Entries registered later win,
    /// so specific families shadow generic ones.
    pub fn resolve(&self, identity: &OsIdentity) -> Result<Arc<dyn Capability>, FlotillaError> {
        self.entries
            .iter()
            .rev()
            .find(|(predicate, _)| predicate(identity))
            .map(|(_, factory)| factory())
            .ok_or_else(|| FlotillaError::MissingOsSupport(identity.to_string()))
    }

    /// The built-in table: generic Linux first, specializations after it.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(
            |_| true,
            || {
                let cap: Arc<dyn Capability> = Arc::new(linux::Linux);
                cap
            },
        );
        registry.register(
            |os| {
                const ENTERPRISE_IDS: &[&str] =
                    &["rhel", "centos", "rocky", "almalinux", "ol", "amzn", "fedora"];
                ENTERPRISE_IDS.contains(&os.id.as_str())
                    || os.id_like_contains("rhel")
                    || os.id_like_contains("fedora")
            },
            || {
                let cap: Arc<dyn Capability> = Arc::new(linux::EnterpriseLinux::default());
                cap
            },
        );
        registry.register(
            |os| os.id == "alpine",
            || {
                let cap: Arc<dyn Capability> = Arc::new(linux::Alpine::default());
                cap
            },
        );
        registry
    }
}

/// Process-wide registry, read-only after first use.
pub fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::builtin)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(id: &str, id_like: &[&str]) -> OsIdentity {
        OsIdentity {
            id: id.into(),
            id_like: id_like.iter().map(|s| (*s).to_string()).collect(),
            version: "1".into(),
            name: String::new(),
        }
    }

    #[test]
    fn test_parse_os_release() {
        let doc = r#"
NAME="Rocky Linux"
VERSION="9.4 (Blue Onyx)"
ID="rocky"
ID_LIKE="rhel centos fedora"
VERSION_ID="9.4"
"#;
        let os = parse_os_release(doc).unwrap();
        assert_eq!(os.id, "rocky");
        assert_eq!(os.id_like, vec!["rhel", "centos", "fedora"]);
        assert_eq!(os.version, "9.4");
        assert_eq!(os.name, "Rocky Linux");
        assert_eq!(os.to_string(), "Rocky Linux 9.4");
    }

    #[test]
    fn test_parse_os_release_unquoted() {
        let os = parse_os_release("ID=alpine\nVERSION_ID=3.20.1\n").unwrap();
        assert_eq!(os.id, "alpine");
        assert_eq!(os.version, "3.20.1");
        assert!(os.id_like.is_empty());
    }

    #[test]
    fn test_parse_os_release_requires_id() {
        assert!(parse_os_release("NAME=Mystery\n").is_err());
    }

    #[test]
    fn test_resolve_missing_support_names_identity() {
        let registry = Registry::new();
        let err = registry.resolve(&identity("plan9", &[])).unwrap_err();
        assert!(err.to_string().contains("plan9"));
        assert!(matches!(err, FlotillaError::MissingOsSupport(_)));
    }

    #[tokio::test]
    async fn test_last_registered_specialization_wins() {
        let mut registry = Registry::new();
        registry.register(
            |_| true,
            || {
                let cap: Arc<dyn Capability> = Arc::new(linux::Linux);
                cap
            },
        );
        registry.register(
            |os| os.id == "alpine",
            || {
                let cap: Arc<dyn Capability> = Arc::new(linux::Alpine::default());
                cap
            },
        );
        // The Alpine specialization must win over the generic entry: its
        // service management goes through OpenRC, not systemd.
        let cap = registry.resolve(&identity("alpine", &[])).unwrap();
        let conn = crate::connection::mock::MockConnection::new("10.0.0.1");
        cap.start_service(&conn, "k0sworker").await.unwrap();
        assert_eq!(conn.executed(), vec!["rc-service k0sworker start"]);

        // The generic entry still serves everything else.
        let cap = registry.resolve(&identity("ubuntu", &["debian"])).unwrap();
        let conn = crate::connection::mock::MockConnection::new("10.0.0.2");
        cap.start_service(&conn, "k0sworker").await.unwrap();
        assert_eq!(conn.executed(), vec!["systemctl start k0sworker"]);
    }

    #[test]
    fn test_builtin_covers_common_families() {
        let registry = Registry::builtin();
        for id in ["ubuntu", "debian", "rocky", "ol", "alpine", "nixos"] {
            assert!(registry.resolve(&identity(id, &[])).is_ok(), "{id}");
        }
    }
}
