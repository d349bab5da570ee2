//! Linux capability implementations.
//!
//! [`Linux`] is the generic systemd base. Families that differ only in a
//! few operations hold a base value and delegate the rest to it instead of
//! re-implementing the whole contract.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;

use super::Capability;
use crate::connection::{Connection, quote};

/// Generic systemd-managed Linux.
#[derive(Debug, Clone, Copy, Default)]
pub struct Linux;

impl Linux {
    fn dropin_path(service: &str) -> String {
        format!("/etc/systemd/system/{service}.service.d/flotilla.conf")
    }
}

#[async_trait]
impl Capability for Linux {
    fn kind(&self) -> &'static str {
        "linux"
    }

    async fn file_exists(&self, conn: &dyn Connection, path: &str) -> bool {
        conn.exec(&format!("test -e {}", quote(path)), false)
            .await
            .is_ok_and(|out| out.success())
    }

    async fn mkdir(&self, conn: &dyn Connection, path: &str) -> Result<()> {
        conn.exec_checked(&format!("mkdir -p -- {}", quote(path)), true)
            .await?;
        Ok(())
    }

    async fn chmod(&self, conn: &dyn Connection, path: &str, perm: &str) -> Result<()> {
        conn.exec_checked(&format!("chmod {} -- {}", quote(perm), quote(path)), true)
            .await?;
        Ok(())
    }

    async fn chown(&self, conn: &dyn Connection, path: &str, owner: &str) -> Result<()> {
        conn.exec_checked(&format!("chown {} -- {}", quote(owner), quote(path)), true)
            .await?;
        Ok(())
    }

    async fn install_binary(&self, conn: &dyn Connection, src: &str, dest: &str) -> Result<()> {
        conn.exec_checked(
            &format!(
                "install -m 0755 -- {src} {dest} && rm -f -- {src}",
                src = quote(src),
                dest = quote(dest)
            ),
            true,
        )
        .await?;
        Ok(())
    }

    async fn start_service(&self, conn: &dyn Connection, service: &str) -> Result<()> {
        conn.exec_checked(&format!("systemctl start {}", quote(service)), true)
            .await?;
        Ok(())
    }

    async fn stop_service(&self, conn: &dyn Connection, service: &str) -> Result<()> {
        conn.exec_checked(&format!("systemctl stop {}", quote(service)), true)
            .await?;
        Ok(())
    }

    async fn service_is_running(&self, conn: &dyn Connection, service: &str) -> Result<bool> {
        let out = conn
            .exec(&format!("systemctl is-active --quiet {}", quote(service)), true)
            .await?;
        Ok(out.success())
    }

    async fn update_service_environment(
        &self,
        conn: &dyn Connection,
        service: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<()> {
        let path = Self::dropin_path(service);
        let mut content = String::from("[Service]\n");
        for (key, value) in env {
            content.push_str(&format!("Environment=\"{key}={value}\"\n"));
        }
        conn.exec_checked(
            &format!(
                "mkdir -p -- $(dirname {path}) && cat > {path} <<'EOF'\n{content}EOF\nsystemctl daemon-reload",
                path = quote(&path),
            ),
            true,
        )
        .await?;
        Ok(())
    }

    async fn cleanup_service_environment(
        &self,
        conn: &dyn Connection,
        service: &str,
    ) -> Result<()> {
        let path = Self::dropin_path(service);
        conn.exec_checked(
            &format!("rm -f -- {} && systemctl daemon-reload", quote(&path)),
            true,
        )
        .await?;
        Ok(())
    }
}

/// RHEL-descended distributions. Service environment lives in
/// `/etc/sysconfig` as the platform units there expect; everything else is
/// the systemd base.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnterpriseLinux {
    base: Linux,
}

impl EnterpriseLinux {
    fn sysconfig_path(service: &str) -> String {
        format!("/etc/sysconfig/{service}")
    }
}

#[async_trait]
impl Capability for EnterpriseLinux {
    fn kind(&self) -> &'static str {
        self.base.kind()
    }

    async fn file_exists(&self, conn: &dyn Connection, path: &str) -> bool {
        self.base.file_exists(conn, path).await
    }

    async fn mkdir(&self, conn: &dyn Connection, path: &str) -> Result<()> {
        self.base.mkdir(conn, path).await
    }

    async fn chmod(&self, conn: &dyn Connection, path: &str, perm: &str) -> Result<()> {
        self.base.chmod(conn, path, perm).await
    }

    async fn chown(&self, conn: &dyn Connection, path: &str, owner: &str) -> Result<()> {
        self.base.chown(conn, path, owner).await
    }

    async fn install_binary(&self, conn: &dyn Connection, src: &str, dest: &str) -> Result<()> {
        self.base.install_binary(conn, src, dest).await
    }

    async fn start_service(&self, conn: &dyn Connection, service: &str) -> Result<()> {
        self.base.start_service(conn, service).await
    }

    async fn stop_service(&self, conn: &dyn Connection, service: &str) -> Result<()> {
        self.base.stop_service(conn, service).await
    }

    async fn service_is_running(&self, conn: &dyn Connection, service: &str) -> Result<bool> {
        self.base.service_is_running(conn, service).await
    }

    async fn update_service_environment(
        &self,
        conn: &dyn Connection,
        service: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<()> {
        let path = Self::sysconfig_path(service);
        let mut content = String::new();
        for (key, value) in env {
            content.push_str(&format!("{key}=\"{value}\"\n"));
        }
        conn.exec_checked(
            &format!("cat > {} <<'EOF'\n{content}EOF", quote(&path)),
            true,
        )
        .await?;
        Ok(())
    }

    async fn cleanup_service_environment(
        &self,
        conn: &dyn Connection,
        service: &str,
    ) -> Result<()> {
        conn.exec_checked(
            &format!("rm -f -- {}", quote(&Self::sysconfig_path(service))),
            true,
        )
        .await?;
        Ok(())
    }
}

/// Alpine Linux: OpenRC service management, `/etc/conf.d` environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct Alpine {
    base: Linux,
}

impl Alpine {
    fn confd_path(service: &str) -> String {
        format!("/etc/conf.d/{service}")
    }
}

#[async_trait]
impl Capability for Alpine {
    fn kind(&self) -> &'static str {
        self.base.kind()
    }

    async fn file_exists(&self, conn: &dyn Connection, path: &str) -> bool {
        self.base.file_exists(conn, path).await
    }

    async fn mkdir(&self, conn: &dyn Connection, path: &str) -> Result<()> {
        self.base.mkdir(conn, path).await
    }

    async fn chmod(&self, conn: &dyn Connection, path: &str, perm: &str) -> Result<()> {
        self.base.chmod(conn, path, perm).await
    }

    async fn chown(&self, conn: &dyn Connection, path: &str, owner: &str) -> Result<()> {
        self.base.chown(conn, path, owner).await
    }

    async fn install_binary(&self, conn: &dyn Connection, src: &str, dest: &str) -> Result<()> {
        self.base.install_binary(conn, src, dest).await
    }

    async fn start_service(&self, conn: &dyn Connection, service: &str) -> Result<()> {
        conn.exec_checked(&format!("rc-service {} start", quote(service)), true)
            .await?;
        Ok(())
    }

    async fn stop_service(&self, conn: &dyn Connection, service: &str) -> Result<()> {
        conn.exec_checked(&format!("rc-service {} stop", quote(service)), true)
            .await?;
        Ok(())
    }

    async fn service_is_running(&self, conn: &dyn Connection, service: &str) -> Result<bool> {
        let out = conn
            .exec(&format!("rc-service {} status", quote(service)), true)
            .await?;
        Ok(out.success())
    }

    async fn update_service_environment(
        &self,
        conn: &dyn Connection,
        service: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<()> {
        let path = Self::confd_path(service);
        let mut content = String::new();
        for (key, value) in env {
            content.push_str(&format!("export {key}=\"{value}\"\n"));
        }
        conn.exec_checked(
            &format!("cat > {} <<'EOF'\n{content}EOF", quote(&path)),
            true,
        )
        .await?;
        Ok(())
    }

    async fn cleanup_service_environment(
        &self,
        conn: &dyn Connection,
        service: &str,
    ) -> Result<()> {
        conn.exec_checked(&format!("rm -f -- {}", quote(&Self::confd_path(service))), true)
            .await?;
        Ok(())
    }
}
