//! Per-host upgrade sequence shared by the controller and worker phases.
//!
//! Stop the service, swap the staged binary in, apply declared service
//! environment overrides, start the service again and wait for it to run.
//! Every mutating step goes through the dry-run guard.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info};

use super::PhaseContext;
use crate::cluster::Host;
use crate::connection::Connection;
use crate::error::FlotillaError;
use crate::retry;

/// Run the full upgrade sequence against one host.
pub(super) async fn upgrade_host(ctx: &Arc<PhaseContext>, host: &Arc<Host>) -> Result<()> {
    let conn = host.connection()?;
    let capability = host.capability()?;
    let service = host.service_name();

    let pending = host
        .metadata()
        .pending_binary
        .clone()
        .ok_or_else(|| FlotillaError::BinaryMissing {
            host: host.address.clone(),
            path: "<none staged>".to_string(),
        })?;
    if ctx.guard.is_wet() && !capability.file_exists(&*conn, &pending).await {
        return Err(FlotillaError::BinaryMissing {
            host: host.address.clone(),
            path: pending,
        }
        .into());
    }

    info!("{host}: starting upgrade");
    debug!("{host}: stop service");
    ctx.guard
        .guard(host, &format!("stop {service} service"), || async {
            capability.stop_service(&*conn, service).await?;
            retry::with_policy(ctx.retry, || async {
                if capability.service_is_running(&*conn, service).await? {
                    Err(anyhow!("{service} still running"))
                } else {
                    Ok(())
                }
            })
            .await
            .context("wait for service stop")
        })
        .await?;

    debug!("{host}: update binary");
    ctx.guard
        .guard(host, "replace platform binary", || async {
            capability
                .install_binary(&*conn, &pending, capability.binary_path())
                .await
        })
        .await?;

    if !host.environment.is_empty() {
        info!("{host}: updating service environment");
        ctx.guard
            .guard(host, "update service environment", || async {
                capability
                    .update_service_environment(&*conn, service, &host.environment)
                    .await
            })
            .await?;
    }

    debug!("{host}: restart service");
    ctx.guard
        .guard(
            host,
            &format!("start {service} service with the new binary"),
            || async {
                capability.start_service(&*conn, service).await?;
                info!("{host}: waiting for the {service} service to start");
                retry::with_policy(ctx.retry, || async {
                    if capability.service_is_running(&*conn, service).await? {
                        Ok(())
                    } else {
                        Err(anyhow!("{service} not running yet"))
                    }
                })
                .await
                .context("wait for service start")
            },
        )
        .await?;

    Ok(())
}

/// Mark a host as upgraded to `version` after a successful wet run.
pub(super) fn mark_upgraded(host: &Host, version: &str) {
    let mut meta = host.metadata();
    meta.current_version = Some(version.to_string());
    meta.needs_upgrade = false;
    meta.pending_binary = None;
}

/// Poll until the API server answers on `port`. Any HTTP response counts:
/// an unauthenticated 401/403 still proves the server is up.
pub(super) async fn api_ready(conn: &dyn Connection, port: u16) -> Result<()> {
    let out = conn
        .exec_checked(
            &format!("curl -ks -o /dev/null -w '%{{http_code}}' https://localhost:{port}/version"),
            false,
        )
        .await?;
    match out.trim() {
        "200" | "401" | "403" => Ok(()),
        code => Err(anyhow!("kube api answered with http {code}")),
    }
}

/// True once the scheduler has produced scheduling events newer than
/// `since`. Stale events from before the upgrade must not count: a
/// scheduler that died mid-upgrade still leaves old ones behind.
pub(super) async fn scheduler_active(
    conn: &dyn Connection,
    binary: &str,
    since: DateTime<Utc>,
) -> Result<()> {
    let raw = conn
        .exec_checked(
            &format!("{binary} kubectl get events -A --field-selector reason=Scheduled -o json"),
            true,
        )
        .await?;
    let doc: Value = serde_json::from_str(&raw).context("parse scheduling events")?;
    let scheduled = doc["items"].as_array().is_some_and(|items| {
        items.iter().any(|event| {
            event["lastTimestamp"]
                .as_str()
                .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
                .is_some_and(|ts| ts.with_timezone(&Utc) >= since)
        })
    });
    if scheduled {
        Ok(())
    } else {
        Err(anyhow!("no scheduling events observed since the upgrade started"))
    }
}

/// True once every pod in kube-system reports the Running phase.
pub(super) async fn system_pods_running(conn: &dyn Connection, binary: &str) -> Result<()> {
    let raw = conn
        .exec_checked(
            &format!("{binary} kubectl get pods -n kube-system -o json"),
            true,
        )
        .await?;
    let doc: Value = serde_json::from_str(&raw).context("parse system pods")?;
    let items = doc["items"]
        .as_array()
        .ok_or_else(|| anyhow!("unexpected pod list shape"))?;
    if items.is_empty() {
        return Err(anyhow!("no system pods reported yet"));
    }
    let pending = items
        .iter()
        .filter(|pod| pod["status"]["phase"].as_str() != Some("Running"))
        .count();
    if pending == 0 {
        Ok(())
    } else {
        Err(anyhow!("{pending} system pod(s) not running yet"))
    }
}
