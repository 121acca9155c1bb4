//! Let's Encrypt certificates for virtual hosts.
//!
//! Issuance runs certbot in standalone mode, which needs port 80, so
//! OpenLiteSpeed is stopped for the ACME exchange and started again on
//! every exit path. Certificate files are then copied into the vhost's
//! cert directory and the `vhssl` block is patched into its conf.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use sqlx::MySqlPool;
use thiserror::Error;
use tracing::{info, warn};

use lp_core::conf::olsconf;
use lp_core::config::OlsConfig;
use lp_core::fs::atomic;
use lp_core::process::{binary_exists, CommandSpec, ProcessRunner};
use lp_core::security::audit::{AuditAction, AuditLogger, AuditResult};
use lp_core::security::input;
use lp_db::models::VirtualHost;
use lp_db::queries;
use lp_db::DbError;

use crate::context::RequestIdentity;
use crate::locks::{self, LockRegistry};

const CERTBOT_BIN: &str = "/usr/bin/certbot";
const LETSENCRYPT_LIVE: &str = "/etc/letsencrypt/live";
const RENEWAL_CRON_LINE: &str = "0 3 * * * /usr/bin/certbot renew --quiet --no-self-upgrade >> /var/log/ssl-renewal.log 2>&1";

/// The ACME exchange plus DNS propagation can be slow.
const CERTBOT_TIMEOUT: Duration = Duration::from_secs(180);
/// apt-get install of certbot on a cold cache.
const INSTALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Certificates within this many days of expiry count as expiring soon
/// and are picked up by the renewal sweep.
pub const EXPIRY_WARNING_DAYS: i64 = 30;

#[derive(Debug, Error)]
pub enum SslError {
    #[error("{0}")]
    Validation(String),
    #[error("Virtual host not found")]
    VhostNotFound,
    #[error("No SSL certificate found for this domain")]
    NoCertificate,
    #[error("Certbot is not installed")]
    CertbotMissing,
    /// Certificate exists but a later step failed.
    #[error("{0}")]
    Partial(String),
    #[error("{0}")]
    External(String),
    #[error("Database error: {0}")]
    Database(#[from] DbError),
}

/// Parsed certificate metadata for one domain.
#[derive(Debug, Clone, Serialize)]
pub struct CertificateInfo {
    pub has_certificate: bool,
    pub domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_until_expiry: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expired: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiring_soon: Option<bool>,
    pub auto_renew_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CertificateInfo {
    fn absent(domain: &str) -> Self {
        Self {
            has_certificate: false,
            domain: domain.to_string(),
            valid: None,
            subject: None,
            issuer: None,
            valid_from: None,
            valid_to: None,
            days_until_expiry: None,
            expired: None,
            expiring_soon: None,
            auto_renew_enabled: false,
            error: None,
        }
    }

    fn unreadable(domain: &str, auto_renew: bool) -> Self {
        Self {
            has_certificate: true,
            auto_renew_enabled: auto_renew,
            error: Some("Invalid certificate file".to_string()),
            ..Self::absent(domain)
        }
    }
}

/// One entry of the certificate overview.
#[derive(Debug, Serialize)]
pub struct CertificateListEntry {
    pub domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    pub auto_renew: bool,
    pub certificate: CertificateInfo,
}

#[derive(Debug, Serialize)]
pub struct SslStatistics {
    pub total: usize,
    pub valid: usize,
    pub expired: usize,
    pub expiring_soon: usize,
    pub lets_encrypt: usize,
    pub auto_renewal_enabled: usize,
    pub certbot_installed: bool,
}

#[derive(Debug, Serialize)]
pub struct RenewAllOutcome {
    pub output: String,
    pub renewed: bool,
}

/// Result of the nightly renewal sweep.
#[derive(Debug, Default, Serialize)]
pub struct RenewalSweep {
    pub checked: usize,
    pub renewed: Vec<String>,
    pub failed: Vec<String>,
}

pub struct SslService {
    pool: MySqlPool,
    ols: OlsConfig,
    runner: Arc<dyn ProcessRunner>,
    locks: Arc<LockRegistry>,
    audit: Arc<dyn AuditLogger>,
}

impl SslService {
    pub fn new(
        pool: MySqlPool,
        ols: OlsConfig,
        runner: Arc<dyn ProcessRunner>,
        locks: Arc<LockRegistry>,
        audit: Arc<dyn AuditLogger>,
    ) -> Self {
        Self {
            pool,
            ols,
            runner,
            locks,
            audit,
        }
    }

    /// Obtain and install a Let's Encrypt certificate for a vhost.
    pub async fn issue(
        &self,
        identity: &RequestIdentity,
        domain: &str,
        email: &str,
        force: bool,
    ) -> Result<CertificateInfo, SslError> {
        let domain = input::validate_domain(domain)
            .map_err(|_| SslError::Validation("Invalid domain format".to_string()))?;
        let vhost = self.lookup(domain).await?;

        // An omitted email falls back to the vhost's contact address.
        let email = if email.is_empty() {
            vhost.email.as_str()
        } else {
            input::validate_email(email)
                .map_err(|_| SslError::Validation("Invalid email format".to_string()))?
        };
        let _guard = self.locks.acquire(&locks::ssl_key(domain)).await;

        if self.cert_path(domain).exists() && !force {
            return Err(SslError::Validation(
                "SSL certificate already exists for this domain. Use force=true to reinstall."
                    .to_string(),
            ));
        }

        if !binary_exists(Path::new(CERTBOT_BIN)) {
            self.install_certbot().await?;
        }

        // Standalone mode binds port 80; park the web server around the
        // ACME exchange and always bring it back.
        self.control_ols("stop").await?;
        let certbot = CommandSpec::new(CERTBOT_BIN)
            .arg("certonly")
            .arg("--standalone")
            .arg("--non-interactive")
            .arg("--agree-tos")
            .arg("--email")
            .arg(email)
            .arg("-d")
            .arg(domain)
            .arg("--force-renewal")
            .elevated()
            .timeout(CERTBOT_TIMEOUT);
        let certbot_result = self.runner.run(&certbot).await;
        if let Err(e) = self.control_ols("start").await {
            warn!(error = %e, "Failed to start OpenLiteSpeed after certbot run");
        }

        let output = certbot_result.map_err(|e| SslError::External(e.to_string()))?;
        if !output.success() {
            self.audit
                .log_event(
                    &identity
                        .event(AuditAction::SslIssue, "ssl")
                        .result(AuditResult::Failed)
                        .details(serde_json::json!({
                            "domain": domain,
                            "error": output.output.trim(),
                        })),
                )
                .await;
            return Err(SslError::External(format!(
                "Failed to obtain SSL certificate from Let's Encrypt: {}",
                output.output.trim()
            )));
        }

        if let Err(detail) = self.configure_vhost_ssl(domain) {
            self.audit
                .log_event(
                    &identity
                        .event(AuditAction::SslIssue, "ssl")
                        .result(AuditResult::Warning)
                        .details(serde_json::json!({
                            "domain": domain,
                            "detail": detail,
                        })),
                )
                .await;
            return Err(SslError::Partial(format!(
                "Certificate obtained but failed to configure OpenLiteSpeed: {detail}"
            )));
        }

        if let Err(e) = self.control_ols("restart").await {
            warn!(domain, error = %e, "Certificate installed but OpenLiteSpeed restart failed");
        }

        queries::set_vhost_ssl(
            &self.pool,
            domain,
            &self.cert_path(domain).to_string_lossy(),
            &self.key_path(domain).to_string_lossy(),
            "Let's Encrypt",
        )
        .await?;

        if let Err(e) = self.ensure_renewal_cron().await {
            warn!(error = %e, "Could not install the certbot renewal cron entry");
        }

        info!(domain, "Installed SSL certificate");
        self.audit
            .log_event(
                &identity
                    .event(AuditAction::SslIssue, "ssl")
                    .entity_id(vhost.id)
                    .details(serde_json::json!({ "domain": domain })),
            )
            .await;

        Ok(self.cert_info(domain).await?)
    }

    /// Renew one domain's certificate through certbot.
    pub async fn renew(
        &self,
        identity: &RequestIdentity,
        domain: &str,
        force: bool,
    ) -> Result<CertificateInfo, SslError> {
        let domain = input::validate_domain(domain)
            .map_err(|_| SslError::Validation("Invalid domain format".to_string()))?;
        self.lookup(domain).await?;
        let _guard = self.locks.acquire(&locks::ssl_key(domain)).await;

        if !self.cert_path(domain).exists() {
            return Err(SslError::NoCertificate);
        }

        let mut spec = CommandSpec::new(CERTBOT_BIN).arg("renew");
        if force {
            spec = spec.arg("--force-renewal");
        }
        let spec = spec
            .arg("--cert-name")
            .arg(domain)
            .arg("--non-interactive")
            .arg("--quiet")
            .elevated()
            .timeout(CERTBOT_TIMEOUT);

        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| SslError::External(e.to_string()))?;
        if !output.success() {
            self.audit
                .log_event(
                    &identity
                        .event(AuditAction::SslRenew, "ssl")
                        .result(AuditResult::Failed)
                        .details(serde_json::json!({
                            "domain": domain,
                            "error": output.output.trim(),
                        })),
                )
                .await;
            return Err(SslError::External(format!(
                "Failed to renew SSL certificate: {}",
                output.output.trim()
            )));
        }

        // Renewed files land in the live dir; refresh the vhost copies.
        if let Err(detail) = self.copy_live_certificates(domain) {
            warn!(domain, detail, "Renewed certificate but vhost copy failed");
        }
        if let Err(e) = self.control_ols("restart").await {
            warn!(domain, error = %e, "Renewed certificate but OpenLiteSpeed restart failed");
        }

        info!(domain, "Renewed SSL certificate");
        self.audit
            .log_event(
                &identity
                    .event(AuditAction::SslRenew, "ssl")
                    .details(serde_json::json!({ "domain": domain })),
            )
            .await;

        Ok(self.cert_info(domain).await?)
    }

    /// Blanket `certbot renew` over every certificate on the host.
    pub async fn renew_all(&self, identity: &RequestIdentity) -> Result<RenewAllOutcome, SslError> {
        if !binary_exists(Path::new(CERTBOT_BIN)) {
            return Err(SslError::CertbotMissing);
        }

        let spec = CommandSpec::new(CERTBOT_BIN)
            .arg("renew")
            .arg("--non-interactive")
            .arg("--quiet")
            .arg("--no-self-upgrade")
            .elevated()
            .timeout(Duration::from_secs(600));
        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| SslError::External(e.to_string()))?;
        if !output.success() {
            return Err(SslError::External(format!(
                "Certificate renewal failed: {}",
                output.output.trim()
            )));
        }

        // --quiet prints nothing when nothing was due.
        let renewed = !output.output.trim().is_empty();
        if renewed {
            if let Err(e) = self.control_ols("restart").await {
                warn!(error = %e, "Certificates renewed but OpenLiteSpeed restart failed");
            }
        }

        self.audit
            .log_event(
                &identity
                    .event(AuditAction::SslRenew, "ssl")
                    .details(serde_json::json!({ "scope": "all", "renewed": renewed })),
            )
            .await;

        Ok(RenewAllOutcome {
            output: output.output.trim().to_string(),
            renewed,
        })
    }

    /// Nightly sweep: renew auto-renew vhosts within the expiry window.
    pub async fn renew_due(&self) -> Result<RenewalSweep, SslError> {
        let vhosts = queries::list_auto_renew_vhosts(&self.pool).await?;
        let mut sweep = RenewalSweep::default();
        let system = RequestIdentity::default();

        for vhost in vhosts {
            sweep.checked += 1;
            let info = self.cert_info(&vhost.domain).await?;
            let due = info
                .days_until_expiry
                .map(|days| days <= EXPIRY_WARNING_DAYS)
                .unwrap_or(false);
            if !info.has_certificate || !due {
                continue;
            }
            match self.renew(&system, &vhost.domain, false).await {
                Ok(_) => sweep.renewed.push(vhost.domain),
                Err(e) => {
                    warn!(domain = %vhost.domain, error = %e, "Scheduled renewal failed");
                    sweep.failed.push(vhost.domain);
                }
            }
        }
        Ok(sweep)
    }

    /// Inspect the installed certificate for a domain.
    pub async fn cert_info(&self, domain: &str) -> Result<CertificateInfo, SslError> {
        let domain = input::validate_domain(domain)
            .map_err(|_| SslError::Validation("Invalid domain format".to_string()))?;
        let auto_renew = match queries::get_vhost_by_domain(&self.pool, domain).await {
            Ok(vhost) => vhost.ssl_auto_renew,
            Err(DbError::NotFound(_)) => false,
            Err(e) => return Err(e.into()),
        };

        let cert_path = self.cert_path(domain);
        if !cert_path.exists() {
            return Ok(CertificateInfo::absent(domain));
        }

        let spec = CommandSpec::new("openssl")
            .arg("x509")
            .arg("-in")
            .arg(cert_path.to_string_lossy().into_owned())
            .arg("-noout")
            .arg("-subject")
            .arg("-issuer")
            .arg("-dates");
        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| SslError::External(e.to_string()))?;
        if !output.success() {
            return Ok(CertificateInfo::unreadable(domain, auto_renew));
        }

        match parse_certificate_text(&output.output) {
            Some(parsed) => {
                let now = Utc::now();
                let days_until_expiry = (parsed.not_after - now).num_days();
                let expired = parsed.not_after < now;
                Ok(CertificateInfo {
                    has_certificate: true,
                    domain: domain.to_string(),
                    valid: Some(!expired),
                    subject: parsed.subject_cn,
                    issuer: parsed.issuer_org,
                    valid_from: Some(parsed.not_before.format("%Y-%m-%d %H:%M:%S").to_string()),
                    valid_to: Some(parsed.not_after.format("%Y-%m-%d %H:%M:%S").to_string()),
                    days_until_expiry: Some(days_until_expiry),
                    expired: Some(expired),
                    expiring_soon: Some(!expired && days_until_expiry <= EXPIRY_WARNING_DAYS),
                    auto_renew_enabled: auto_renew,
                    error: None,
                })
            }
            None => Ok(CertificateInfo::unreadable(domain, auto_renew)),
        }
    }

    /// Delete the certificate from certbot, the vhost conf, and the
    /// panel record.
    pub async fn remove(
        &self,
        identity: &RequestIdentity,
        domain: &str,
    ) -> Result<(), SslError> {
        let domain = input::validate_domain(domain)
            .map_err(|_| SslError::Validation("Invalid domain format".to_string()))?;
        let vhost = self.lookup(domain).await?;
        let _guard = self.locks.acquire(&locks::ssl_key(domain)).await;

        let spec = CommandSpec::new(CERTBOT_BIN)
            .arg("delete")
            .arg("--cert-name")
            .arg(domain)
            .arg("--non-interactive")
            .elevated();
        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| SslError::External(e.to_string()))?;
        if !output.success() {
            self.audit
                .log_event(
                    &identity
                        .event(AuditAction::SslRemove, "ssl")
                        .result(AuditResult::Failed)
                        .details(serde_json::json!({
                            "domain": domain,
                            "error": output.output.trim(),
                        })),
                )
                .await;
            return Err(SslError::External(format!(
                "Failed to remove SSL certificate: {}",
                output.output.trim()
            )));
        }

        self.strip_vhssl_block(domain);
        queries::clear_vhost_ssl(&self.pool, domain).await?;

        info!(domain, "Removed SSL certificate");
        self.audit
            .log_event(
                &identity
                    .event(AuditAction::SslRemove, "ssl")
                    .entity_id(vhost.id)
                    .details(serde_json::json!({ "domain": domain })),
            )
            .await;
        Ok(())
    }

    pub async fn set_auto_renew(
        &self,
        identity: &RequestIdentity,
        domain: &str,
        enabled: bool,
    ) -> Result<(), SslError> {
        let domain = input::validate_domain(domain)
            .map_err(|_| SslError::Validation("Invalid domain format".to_string()))?;
        self.lookup(domain).await?;
        queries::set_vhost_auto_renew(&self.pool, domain, enabled).await?;

        self.audit
            .log_event(
                &identity
                    .event(AuditAction::SslRenew, "ssl")
                    .details(serde_json::json!({ "domain": domain, "auto_renew": enabled })),
            )
            .await;
        Ok(())
    }

    /// Certificate overview across every SSL-enabled vhost.
    pub async fn list_certificates(&self) -> Result<Vec<CertificateListEntry>, SslError> {
        let vhosts = queries::list_ssl_vhosts(&self.pool).await?;
        let mut entries = Vec::with_capacity(vhosts.len());
        for vhost in vhosts {
            let certificate = self.cert_info(&vhost.domain).await?;
            entries.push(CertificateListEntry {
                domain: vhost.domain,
                issuer: vhost.ssl_issuer,
                auto_renew: vhost.ssl_auto_renew,
                certificate,
            });
        }
        Ok(entries)
    }

    pub async fn statistics(&self) -> Result<SslStatistics, SslError> {
        let entries = self.list_certificates().await?;
        let mut stats = SslStatistics {
            total: entries.len(),
            valid: 0,
            expired: 0,
            expiring_soon: 0,
            lets_encrypt: 0,
            auto_renewal_enabled: 0,
            certbot_installed: binary_exists(Path::new(CERTBOT_BIN)),
        };
        for entry in &entries {
            let cert = &entry.certificate;
            if cert.valid == Some(true) {
                stats.valid += 1;
            }
            if cert.expired == Some(true) {
                stats.expired += 1;
            }
            if cert.expiring_soon == Some(true) {
                stats.expiring_soon += 1;
            }
            if entry
                .issuer
                .as_deref()
                .is_some_and(|issuer| issuer.contains("Let's Encrypt"))
            {
                stats.lets_encrypt += 1;
            }
            if entry.auto_renew {
                stats.auto_renewal_enabled += 1;
            }
        }
        Ok(stats)
    }

    fn cert_path(&self, domain: &str) -> PathBuf {
        self.ols
            .vhosts_dir
            .join(domain)
            .join("cert")
            .join(format!("{domain}.crt"))
    }

    fn key_path(&self, domain: &str) -> PathBuf {
        self.ols
            .vhosts_dir
            .join(domain)
            .join("cert")
            .join(format!("{domain}.key"))
    }

    async fn lookup(&self, domain: &str) -> Result<VirtualHost, SslError> {
        match queries::get_vhost_by_domain(&self.pool, domain).await {
            Ok(vhost) => Ok(vhost),
            Err(DbError::NotFound(_)) => Err(SslError::VhostNotFound),
            Err(e) => Err(e.into()),
        }
    }

    async fn control_ols(&self, action: &str) -> Result<(), SslError> {
        let spec = CommandSpec::new(self.ols.control_bin.to_string_lossy().into_owned())
            .arg(action)
            .elevated();
        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| SslError::External(e.to_string()))?;
        if !output.success() {
            return Err(SslError::External(format!(
                "OpenLiteSpeed {action} failed: {}",
                output.output.trim()
            )));
        }
        Ok(())
    }

    async fn install_certbot(&self) -> Result<(), SslError> {
        info!("Certbot not found, installing");
        let spec = CommandSpec::new("apt-get")
            .arg("install")
            .arg("-y")
            .arg("certbot")
            .env("DEBIAN_FRONTEND", "noninteractive")
            .elevated()
            .timeout(INSTALL_TIMEOUT);
        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| SslError::External(e.to_string()))?;
        if !output.success() {
            return Err(SslError::External(format!(
                "Failed to install Certbot: {}",
                output.output.trim()
            )));
        }
        info!("Certbot installed successfully");
        Ok(())
    }

    /// Copy the issued files into the vhost cert dir and patch the
    /// `vhssl` block into its conf. Returns a detail string on failure.
    fn configure_vhost_ssl(&self, domain: &str) -> Result<(), String> {
        self.copy_live_certificates(domain)?;

        let vhconf_path = self.ols.vhosts_dir.join(domain).join("vhconf.conf");
        let content = std::fs::read_to_string(&vhconf_path)
            .map_err(|e| format!("failed to read vhost configuration: {e}"))?;
        if !olsconf::has_vhssl(&content) {
            let block = olsconf::vhssl_block(&self.cert_path(domain), &self.key_path(domain));
            let updated = olsconf::append_block(&content, &block);
            atomic::atomic_write_config(&vhconf_path, &updated)
                .map_err(|e| format!("failed to write vhost configuration: {e}"))?;
        }
        Ok(())
    }

    fn copy_live_certificates(&self, domain: &str) -> Result<(), String> {
        let live = Path::new(LETSENCRYPT_LIVE).join(domain);
        let fullchain = live.join("fullchain.pem");
        let privkey = live.join("privkey.pem");
        if !fullchain.exists() || !privkey.exists() {
            return Err("Certificate files not found after Let's Encrypt request".to_string());
        }

        let cert_dir = self.ols.vhosts_dir.join(domain).join("cert");
        std::fs::create_dir_all(&cert_dir)
            .map_err(|_| "Failed to copy certificate files to virtual host directory".to_string())?;

        let copy = |src: &Path, dest: &Path, secret: bool| -> Result<(), String> {
            let contents = std::fs::read_to_string(src).map_err(|_| {
                "Failed to copy certificate files to virtual host directory".to_string()
            })?;
            let result = if secret {
                atomic::atomic_write_secret(dest, &contents)
            } else {
                atomic::atomic_write_config(dest, &contents)
            };
            result.map_err(|_| {
                "Failed to copy certificate files to virtual host directory".to_string()
            })
        };
        copy(&fullchain, &self.cert_path(domain), false)?;
        copy(&privkey, &self.key_path(domain), true)?;
        Ok(())
    }

    /// Best-effort removal of the vhssl block when a cert is deleted.
    fn strip_vhssl_block(&self, domain: &str) {
        let vhconf_path = self.ols.vhosts_dir.join(domain).join("vhconf.conf");
        let Ok(content) = std::fs::read_to_string(&vhconf_path) else {
            return;
        };
        if !olsconf::has_vhssl(&content) {
            return;
        }
        let cleaned = olsconf::remove_vhssl(&content);
        if let Err(e) = atomic::atomic_write_config(&vhconf_path, &cleaned) {
            warn!(domain, error = %e, "Failed to strip vhssl block from vhost configuration");
        }
    }

    /// Install the nightly renewal cron entry unless already present.
    async fn ensure_renewal_cron(&self) -> Result<(), SslError> {
        let list = CommandSpec::new("crontab").arg("-l").elevated();
        let existing = match self.runner.run(&list).await {
            // No crontab yet reads as a failure with an empty table.
            Ok(output) if output.success() => output.output,
            Ok(_) => String::new(),
            Err(e) => return Err(SslError::External(e.to_string())),
        };
        if existing.contains("certbot renew") {
            return Ok(());
        }

        let mut crontab = existing;
        if !crontab.is_empty() && !crontab.ends_with('\n') {
            crontab.push('\n');
        }
        crontab.push_str(RENEWAL_CRON_LINE);
        crontab.push('\n');

        let mut tmp = tempfile::NamedTempFile::new()
            .map_err(|e| SslError::External(e.to_string()))?;
        tmp.write_all(crontab.as_bytes())
            .map_err(|e| SslError::External(e.to_string()))?;

        let install = CommandSpec::new("crontab")
            .arg(tmp.path().to_string_lossy().into_owned())
            .elevated();
        let output = self
            .runner
            .run(&install)
            .await
            .map_err(|e| SslError::External(e.to_string()))?;
        if !output.success() {
            return Err(SslError::External(format!(
                "crontab install failed: {}",
                output.output.trim()
            )));
        }
        info!("Installed certbot renewal cron entry");
        Ok(())
    }
}

struct ParsedCertificate {
    subject_cn: Option<String>,
    issuer_org: Option<String>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

/// Parse `openssl x509 -noout -subject -issuer -dates` output.
fn parse_certificate_text(text: &str) -> Option<ParsedCertificate> {
    let mut subject_cn = None;
    let mut issuer_org = None;
    let mut not_before = None;
    let mut not_after = None;

    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("subject=") {
            subject_cn = rdn_value(rest, "CN");
        } else if let Some(rest) = line.strip_prefix("issuer=") {
            issuer_org = rdn_value(rest, "O");
        } else if let Some(rest) = line.strip_prefix("notBefore=") {
            not_before = parse_openssl_date(rest);
        } else if let Some(rest) = line.strip_prefix("notAfter=") {
            not_after = parse_openssl_date(rest);
        }
    }

    Some(ParsedCertificate {
        subject_cn,
        issuer_org,
        not_before: not_before?,
        not_after: not_after?,
    })
}

/// Extract one attribute from an RDN sequence like
/// `C = US, O = Let's Encrypt, CN = R11`.
fn rdn_value(line: &str, attr: &str) -> Option<String> {
    line.split(',').find_map(|part| {
        let (key, value) = part.split_once('=')?;
        (key.trim() == attr).then(|| value.trim().to_string())
    })
}

/// Parse openssl's `Jun  1 00:00:00 2026 GMT` date format.
fn parse_openssl_date(text: &str) -> Option<DateTime<Utc>> {
    let trimmed = text.trim().trim_end_matches(" GMT");
    NaiveDateTime::parse_from_str(trimmed, "%b %e %H:%M:%S %Y")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPENSSL_OUTPUT: &str = "subject=CN = example.com\n\
         issuer=C = US, O = Let's Encrypt, CN = R11\n\
         notBefore=Jun  1 00:00:00 2026 GMT\n\
         notAfter=Aug 30 23:59:59 2026 GMT\n";

    #[test]
    fn test_parse_certificate_text() {
        let parsed = parse_certificate_text(OPENSSL_OUTPUT).unwrap();
        assert_eq!(parsed.subject_cn.as_deref(), Some("example.com"));
        assert_eq!(parsed.issuer_org.as_deref(), Some("Let's Encrypt"));
        assert_eq!(
            parsed.not_before.format("%Y-%m-%d %H:%M:%S").to_string(),
            "2026-06-01 00:00:00"
        );
        assert_eq!(
            parsed.not_after.format("%Y-%m-%d %H:%M:%S").to_string(),
            "2026-08-30 23:59:59"
        );
    }

    #[test]
    fn test_parse_certificate_text_requires_dates() {
        assert!(parse_certificate_text("subject=CN = x\n").is_none());
    }

    #[test]
    fn test_rdn_value_picks_exact_attribute() {
        let rdn = "C = US, O = Let's Encrypt, CN = R11";
        assert_eq!(rdn_value(rdn, "O").as_deref(), Some("Let's Encrypt"));
        assert_eq!(rdn_value(rdn, "CN").as_deref(), Some("R11"));
        assert_eq!(rdn_value(rdn, "OU"), None);
    }

    #[test]
    fn test_parse_openssl_date_single_digit_day() {
        let date = parse_openssl_date("Jun  1 00:00:00 2026 GMT").unwrap();
        assert_eq!(date.format("%d").to_string(), "01");
        assert!(parse_openssl_date("not a date").is_none());
    }
}
