//! Virtual host lifecycle: OpenLiteSpeed provisioning plus panel records.
//!
//! The external change always runs before the panel write. When the
//! insert or delete of the record fails afterwards, the operation
//! reports partial success and audits the drift instead of attempting a
//! rollback of the host.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::MySqlPool;
use thiserror::Error;
use tracing::{error, info, warn};

use lp_core::conf::olsconf;
use lp_core::config::{OlsConfig, PhpConfig};
use lp_core::fs::atomic;
use lp_core::process::{CommandSpec, ProcessRunner};
use lp_core::security::audit::{AuditAction, AuditLogger, AuditResult};
use lp_core::security::input;
use lp_db::models::{NewVirtualHost, VhostFieldUpdate, VirtualHost};
use lp_db::queries;
use lp_db::DbError;

use crate::context::RequestIdentity;
use crate::locks::{self, LockRegistry};

pub const VHOST_TYPES: &[&str] = &["wordpress", "custom", "proxy"];
pub const VHOST_STATUSES: &[&str] = &["active", "suspended", "pending"];

/// Provisioning can download WordPress; give it room.
const VHSETUP_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum VhostError {
    #[error("{0}")]
    Validation(String),
    #[error("Virtual host not found")]
    NotFound,
    /// External change succeeded but the panel record did not follow.
    #[error("{0}")]
    Partial(String),
    #[error("{0}")]
    External(String),
    #[error("Failed to update OpenLiteSpeed configuration: {0}")]
    Config(String),
    #[error("Database error: {0}")]
    Database(#[from] DbError),
}

#[derive(Debug, Serialize)]
pub struct VhostList {
    pub vhosts: Vec<VirtualHost>,
    pub total: usize,
    pub active: usize,
}

#[derive(Debug, Serialize)]
pub struct SslFileInfo {
    pub cert_path: String,
    pub key_path: String,
    pub cert_exists: bool,
    pub key_exists: bool,
}

#[derive(Debug, Serialize)]
pub struct VhostDetail {
    #[serde(flatten)]
    pub vhost: VirtualHost,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_info: Option<SslFileInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CreateVhostRequest {
    pub domain: String,
    pub email: String,
    #[serde(rename = "type")]
    pub vhost_type: String,
    pub backend_host: Option<String>,
    pub backend_port: Option<i64>,
    pub docroot: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreatedVhost {
    pub id: i64,
    pub domain: String,
    #[serde(rename = "type")]
    pub vhost_type: String,
    pub docroot: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UpdateVhostRequest {
    pub email: Option<String>,
    pub status: Option<String>,
    pub ssl_enabled: Option<bool>,
    pub ssl_cert: Option<String>,
    pub ssl_key: Option<String>,
    pub backend_host: Option<String>,
    pub backend_port: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct UpdatedVhost {
    pub id: i64,
    pub updated_fields: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct DeletedVhost {
    pub id: i64,
    pub domain: String,
    pub database_deleted: bool,
}

#[derive(Debug, Serialize)]
pub struct DnsProbe {
    pub has_dns: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DomainCheck {
    pub domain: String,
    pub available: bool,
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_vhost: Option<VirtualHost>,
    pub message: String,
    pub dns: DnsProbe,
}

pub struct VhostService {
    pool: MySqlPool,
    ols: OlsConfig,
    php: PhpConfig,
    runner: Arc<dyn ProcessRunner>,
    locks: Arc<LockRegistry>,
    audit: Arc<dyn AuditLogger>,
}

impl VhostService {
    pub fn new(
        pool: MySqlPool,
        ols: OlsConfig,
        php: PhpConfig,
        runner: Arc<dyn ProcessRunner>,
        locks: Arc<LockRegistry>,
        audit: Arc<dyn AuditLogger>,
    ) -> Self {
        Self {
            pool,
            ols,
            php,
            runner,
            locks,
            audit,
        }
    }

    pub async fn list(&self) -> Result<VhostList, VhostError> {
        let vhosts = queries::list_vhosts(&self.pool).await?;
        let total = vhosts.len();
        let active = vhosts.iter().filter(|v| v.status == "active").count();
        Ok(VhostList {
            vhosts,
            total,
            active,
        })
    }

    pub async fn get(&self, id: i64) -> Result<VhostDetail, VhostError> {
        let vhost = self.lookup(id).await?;
        let ssl_info = vhost.ssl_enabled.then(|| {
            let cert_dir = self.cert_dir(&vhost.domain);
            let cert_path = cert_dir.join(format!("{}.crt", vhost.domain));
            let key_path = cert_dir.join(format!("{}.key", vhost.domain));
            SslFileInfo {
                cert_exists: cert_path.exists(),
                key_exists: key_path.exists(),
                cert_path: cert_path.to_string_lossy().into_owned(),
                key_path: key_path.to_string_lossy().into_owned(),
            }
        });
        Ok(VhostDetail { vhost, ssl_info })
    }

    /// Provision a virtual host and record it.
    pub async fn create(
        &self,
        identity: &RequestIdentity,
        req: &CreateVhostRequest,
    ) -> Result<CreatedVhost, VhostError> {
        let created_by = identity
            .user_id
            .ok_or_else(|| VhostError::Validation("Authentication required".to_string()))?;

        for (value, field) in [
            (&req.domain, "domain"),
            (&req.email, "email"),
            (&req.vhost_type, "type"),
        ] {
            if value.is_empty() {
                return Err(VhostError::Validation(format!(
                    "Field '{field}' is required"
                )));
            }
        }
        let domain = input::validate_domain(&req.domain)
            .map_err(|_| VhostError::Validation("Invalid domain format".to_string()))?;
        input::validate_email(&req.email)
            .map_err(|_| VhostError::Validation("Invalid email format".to_string()))?;
        if !VHOST_TYPES.contains(&req.vhost_type.as_str()) {
            return Err(VhostError::Validation(
                "Invalid virtual host type. Must be: wordpress, custom, or proxy".to_string(),
            ));
        }
        let backend_port = if req.vhost_type == "proxy" {
            let port = req.backend_port.ok_or_else(|| {
                VhostError::Validation("Backend port is required for proxy type".to_string())
            })?;
            Some(
                input::validate_backend_port(port)
                    .map_err(|_| VhostError::Validation("Invalid backend port".to_string()))?,
            )
        } else {
            None
        };

        let _guard = self.locks.acquire(&locks::vhost_key(domain)).await;

        if queries::vhost_domain_exists(&self.pool, domain).await? {
            return Err(VhostError::Validation("Domain already exists".to_string()));
        }

        let docroot = match &req.docroot {
            Some(path) => path.clone(),
            None => self
                .ols
                .default_docroot
                .join(domain)
                .join("html")
                .to_string_lossy()
                .into_owned(),
        };

        let mut spec = CommandSpec::new(self.ols.vhsetup_bin.to_string_lossy().into_owned())
            .arg("-d")
            .arg(domain)
            .arg("-le")
            .arg(&req.email)
            .arg("-f")
            .elevated()
            .timeout(VHSETUP_TIMEOUT);
        if req.vhost_type == "wordpress" {
            spec = spec.arg("-w");
        }
        spec = spec.arg("--path").arg(&docroot);

        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| VhostError::External(e.to_string()))?;
        if !output.success() {
            self.audit
                .log_event(
                    &identity
                        .event(AuditAction::VhostCreate, "vhost")
                        .result(AuditResult::Failed)
                        .details(serde_json::json!({
                            "domain": domain,
                            "error": output.output.trim(),
                        })),
                )
                .await;
            return Err(VhostError::External(format!(
                "Virtual host setup failed: {}",
                output.output.trim()
            )));
        }

        let backend_host = req
            .backend_host
            .clone()
            .unwrap_or_else(|| "127.0.0.1".to_string());
        if let Some(port) = backend_port {
            self.configure_proxy(domain, &backend_host, port).await?;
            self.restart_ols().await?;
        }

        let new = NewVirtualHost {
            domain: domain.to_string(),
            docroot: docroot.clone(),
            email: req.email.clone(),
            vhost_type: req.vhost_type.clone(),
            backend_host: backend_port.map(|_| backend_host.clone()),
            backend_port: backend_port.map(i32::from),
            php_version: self.php.version.clone(),
            created_by,
        };
        let id = match queries::insert_vhost(&self.pool, &new).await {
            Ok(id) => id,
            // A concurrent panel process won the insert race; the row
            // exists, so nothing drifted.
            Err(DbError::Duplicate(message)) => {
                return Err(VhostError::Validation(message));
            }
            Err(e) => {
                error!(domain, error = %e, "Vhost provisioned but panel insert failed");
                self.audit
                    .log_event(
                        &identity
                            .event(AuditAction::VhostCreate, "vhost")
                            .result(AuditResult::Warning)
                            .details(serde_json::json!({
                                "domain": domain,
                                "drift": "provisioned on host, missing from panel",
                                "error": e.to_string(),
                            })),
                    )
                    .await;
                return Err(VhostError::Partial(
                    "Virtual host created but failed to save to database".to_string(),
                ));
            }
        };

        info!(domain, id, vhost_type = %req.vhost_type, "Created virtual host");
        self.audit
            .log_event(
                &identity
                    .event(AuditAction::VhostCreate, "vhost")
                    .entity_id(id)
                    .details(serde_json::json!({
                        "domain": domain,
                        "type": req.vhost_type,
                    })),
            )
            .await;

        Ok(CreatedVhost {
            id,
            domain: domain.to_string(),
            vhost_type: req.vhost_type.clone(),
            docroot,
        })
    }

    /// Update the whitelisted mutable fields of a vhost record.
    pub async fn update(
        &self,
        identity: &RequestIdentity,
        id: i64,
        req: &UpdateVhostRequest,
    ) -> Result<UpdatedVhost, VhostError> {
        let vhost = self.lookup(id).await?;
        let _guard = self.locks.acquire(&locks::vhost_key(&vhost.domain)).await;

        let mut update = VhostFieldUpdate::default();
        if let Some(ref email) = req.email {
            input::validate_email(email)
                .map_err(|_| VhostError::Validation("Invalid email format".to_string()))?;
            update.email = Some(email.clone());
        }
        if let Some(ref status) = req.status {
            if !VHOST_STATUSES.contains(&status.as_str()) {
                return Err(VhostError::Validation("Invalid status value".to_string()));
            }
            update.status = Some(status.clone());
        }
        update.ssl_enabled = req.ssl_enabled;
        update.ssl_cert = req.ssl_cert.clone();
        update.ssl_key = req.ssl_key.clone();

        if req.backend_host.is_some() || req.backend_port.is_some() {
            if vhost.vhost_type != "proxy" {
                return Err(VhostError::Validation(
                    "Backend settings only apply to proxy virtual hosts".to_string(),
                ));
            }
            update.backend_host = req.backend_host.clone();
            if let Some(port) = req.backend_port {
                let port = input::validate_backend_port(port)
                    .map_err(|_| VhostError::Validation("Invalid backend port".to_string()))?;
                update.backend_port = Some(i32::from(port));
            }
        }

        if update.is_empty() {
            return Err(VhostError::Validation("No fields to update".to_string()));
        }

        queries::update_vhost_fields(&self.pool, id, &update).await?;
        let updated_fields = update.touched();

        info!(domain = %vhost.domain, ?updated_fields, "Updated virtual host");
        self.audit
            .log_event(
                &identity
                    .event(AuditAction::VhostUpdate, "vhost")
                    .entity_id(id)
                    .details(serde_json::json!({
                        "domain": vhost.domain,
                        "updated_fields": updated_fields,
                    })),
            )
            .await;

        Ok(UpdatedVhost { id, updated_fields })
    }

    /// Tear down a virtual host: its directories, its member lines in
    /// httpd_config.conf, optionally its panel database, then the record.
    pub async fn delete(
        &self,
        identity: &RequestIdentity,
        id: i64,
        confirm: bool,
        delete_database: bool,
    ) -> Result<DeletedVhost, VhostError> {
        if !confirm {
            return Err(VhostError::Validation(
                "Please confirm deletion by adding ?confirm=true".to_string(),
            ));
        }
        let vhost = self.lookup(id).await?;
        let domain = vhost.domain.clone();
        let _guard = self.locks.acquire(&locks::vhost_key(&domain)).await;

        let mut database_deleted = false;
        if delete_database {
            database_deleted = self.drop_associated_database(&domain).await?;
        }

        // Host directories first; a failure here leaves the row intact
        // so the vhost stays visible in the panel.
        let conf_dir = self.ols.vhosts_dir.join(&domain);
        let site_dir = self.ols.default_docroot.join(&domain);
        for dir in [&conf_dir, &site_dir] {
            if let Err(e) = std::fs::remove_dir_all(dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(VhostError::Config(format!(
                        "failed to remove {}: {e}",
                        dir.display()
                    )));
                }
            }
        }

        {
            let _conf_guard = self.locks.acquire(locks::HTTPD_CONF_KEY).await;
            let content = std::fs::read_to_string(&self.ols.httpd_conf)
                .map_err(|e| VhostError::Config(e.to_string()))?;
            let cleaned = olsconf::remove_domain_references(&content, &domain);
            if cleaned != content {
                atomic::atomic_write_config(&self.ols.httpd_conf, &cleaned)
                    .map_err(|e| VhostError::Config(e.to_string()))?;
            }
        }

        queries::delete_vhost_by_domain(&self.pool, &domain).await?;

        if let Err(e) = self.restart_ols().await {
            warn!(domain, error = %e, "Vhost removed but OpenLiteSpeed restart failed");
        }

        info!(domain, database_deleted, "Deleted virtual host");
        self.audit
            .log_event(
                &identity
                    .event(AuditAction::VhostDelete, "vhost")
                    .entity_id(id)
                    .details(serde_json::json!({
                        "domain": domain,
                        "database_deleted": database_deleted,
                    })),
            )
            .await;

        Ok(DeletedVhost {
            id,
            domain,
            database_deleted,
        })
    }

    /// Availability check plus a DNS probe for the onboarding form.
    pub async fn check_domain(&self, domain: &str) -> Result<DomainCheck, VhostError> {
        if domain.is_empty() {
            return Err(VhostError::Validation("Domain is required".to_string()));
        }
        let domain = input::validate_domain(domain)
            .map_err(|_| VhostError::Validation("Invalid domain format".to_string()))?;

        let current_vhost = match queries::get_vhost_by_domain(&self.pool, domain).await {
            Ok(vhost) => Some(vhost),
            Err(DbError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };
        let exists = current_vhost.is_some();

        let mut ip = None;
        let mut ipv6 = None;
        if let Ok(addrs) = tokio::net::lookup_host((domain, 80u16)).await {
            for addr in addrs {
                match addr.ip() {
                    IpAddr::V4(v4) if ip.is_none() => ip = Some(v4.to_string()),
                    IpAddr::V6(v6) if ipv6.is_none() => ipv6 = Some(v6.to_string()),
                    _ => {}
                }
            }
        }

        Ok(DomainCheck {
            domain: domain.to_string(),
            available: !exists,
            exists,
            current_vhost,
            message: if exists {
                "Domain already exists in panel".to_string()
            } else {
                "Domain is available".to_string()
            },
            dns: DnsProbe {
                has_dns: ip.is_some() || ipv6.is_some(),
                ip,
                ipv6,
            },
        })
    }

    async fn lookup(&self, id: i64) -> Result<VirtualHost, VhostError> {
        match queries::get_vhost_by_id(&self.pool, id).await {
            Ok(vhost) => Ok(vhost),
            Err(DbError::NotFound(_)) => Err(VhostError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    fn cert_dir(&self, domain: &str) -> PathBuf {
        self.ols.vhosts_dir.join(domain).join("cert")
    }

    /// Wire a reverse-proxy vhost: an `extprocessor` in the server conf
    /// and a root `context` in the vhost conf pointing at it.
    async fn configure_proxy(
        &self,
        domain: &str,
        backend_host: &str,
        backend_port: u16,
    ) -> Result<(), VhostError> {
        let handler = olsconf::proxy_handler_name(domain, backend_port);

        {
            let _conf_guard = self.locks.acquire(locks::HTTPD_CONF_KEY).await;
            let content = std::fs::read_to_string(&self.ols.httpd_conf)
                .map_err(|e| VhostError::Config(e.to_string()))?;
            let block = olsconf::extprocessor_block(&handler, backend_host, backend_port);
            let updated = olsconf::append_block(&content, &block);
            atomic::atomic_write_config(&self.ols.httpd_conf, &updated)
                .map_err(|e| VhostError::Config(e.to_string()))?;
        }

        let vhconf_path = self.ols.vhosts_dir.join(domain).join("vhconf.conf");
        let content = std::fs::read_to_string(&vhconf_path)
            .map_err(|e| VhostError::Config(e.to_string()))?;
        let block = olsconf::proxy_context_block("/", &handler);
        let updated = olsconf::append_block(&content, &block);
        atomic::atomic_write_config(&vhconf_path, &updated)
            .map_err(|e| VhostError::Config(e.to_string()))?;

        Ok(())
    }

    /// Drop the panel database conventionally named after the domain,
    /// along with its user and catalog row. Returns whether one existed.
    async fn drop_associated_database(&self, domain: &str) -> Result<bool, VhostError> {
        let derived: String = domain
            .chars()
            .map(|c| if c == '.' || c == '-' { '_' } else { c })
            .collect();
        let Some(managed) = queries::get_managed_database(&self.pool, &derived).await? else {
            return Ok(false);
        };

        queries::drop_database_ddl(&self.pool, &managed.name).await?;
        queries::drop_db_user_ddl(&self.pool, &managed.username, &managed.host).await?;
        queries::flush_privileges(&self.pool).await?;
        queries::delete_managed_database(&self.pool, &managed.name).await?;
        info!(domain, database = %managed.name, "Dropped database with virtual host");
        Ok(true)
    }

    async fn restart_ols(&self) -> Result<(), VhostError> {
        let spec = CommandSpec::new(self.ols.control_bin.to_string_lossy().into_owned())
            .arg("restart")
            .elevated();
        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| VhostError::External(e.to_string()))?;
        if !output.success() {
            return Err(VhostError::External(format!(
                "OpenLiteSpeed restart failed: {}",
                output.output.trim()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vhost_type_and_status_catalogs() {
        assert!(VHOST_TYPES.contains(&"proxy"));
        assert!(!VHOST_TYPES.contains(&"static"));
        assert!(VHOST_STATUSES.contains(&"pending"));
    }
}
