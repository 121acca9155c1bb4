//! PHP extension management: the catalog, the installer, and php.ini.
//!
//! The catalog row's `enabled` flag is desired state; what `php -m`
//! reports is observed state. The two can diverge when an ini rewrite
//! or a reload fails, and the list endpoint surfaces both rather than
//! papering over the difference.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sqlx::MySqlPool;
use thiserror::Error;
use tracing::{info, warn};

use lp_core::conf::ini::IniFile;
use lp_core::config::{OlsConfig, PhpConfig};
use lp_core::fs::archive;
use lp_core::fs::atomic;
use lp_core::process::{CommandSpec, ProcessRunner};
use lp_core::security::audit::{AuditAction, AuditLogger, AuditResult};
use lp_core::security::input;
use lp_db::models::PhpExtension;
use lp_db::queries;
use lp_db::DbError;

use crate::context::RequestIdentity;
use crate::locks::{self, LockRegistry};

/// Extensions installable through the lsphp apt packages. Everything
/// else in the catalog ships with lsphp-common or has no package.
const APT_PACKAGES: &[(&str, &str)] = &[
    ("imagick", "imagick"),
    ("intl", "intl"),
    ("redis", "redis"),
    ("memcached", "memcached"),
    ("apcu", "apcu"),
    ("imap", "imap"),
];

const IONCUBE_URL: &str =
    "https://downloads.ioncube.com/loader_downloads/ioncube_loaders_lin_x86-64.tar.gz";

const INSTALL_TIMEOUT: Duration = Duration::from_secs(300);

/// php.ini keys surfaced in the config editor summary.
const SUMMARY_KEYS: &[&str] = &[
    "memory_limit",
    "max_execution_time",
    "upload_max_filesize",
    "post_max_size",
    "max_input_vars",
    "date.timezone",
    "opcache.enable",
    "opcache.memory_consumption",
];

#[derive(Debug, Error)]
pub enum PhpExtError {
    #[error("{0}")]
    Validation(String),
    #[error("PHP configuration file not found")]
    IniNotFound,
    #[error("{0}")]
    External(String),
    #[error("Failed to update php.ini: {0}")]
    Config(String),
    #[error("Database error: {0}")]
    Database(#[from] DbError),
}

/// Catalog row plus what the runtime actually reports.
#[derive(Debug, Serialize)]
pub struct ExtensionStatus {
    #[serde(flatten)]
    pub extension: PhpExtension,
    /// Loaded according to `php -m` right now.
    pub live: bool,
}

#[derive(Debug, Serialize)]
pub struct ExtensionList {
    pub extensions: Vec<ExtensionStatus>,
    pub php_version: String,
    pub php_ini_path: String,
    pub total: usize,
    pub installed: usize,
    pub enabled: usize,
}

#[derive(Debug, Serialize)]
pub struct InstallOutcome {
    pub extension: String,
    pub output: String,
}

#[derive(Debug, Serialize)]
pub struct ToggleOutcome {
    pub extension: String,
    pub enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct ApplyOutcome {
    pub enabled_extensions: Vec<String>,
    pub total: usize,
    pub reloaded: bool,
}

#[derive(Debug, Serialize)]
pub struct PhpConfigView {
    pub config: String,
    pub settings: BTreeMap<String, String>,
    pub ini_path: String,
}

#[derive(Debug, Serialize)]
pub struct SaveConfigOutcome {
    pub saved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<String>,
    pub reloaded: bool,
}

pub struct ExtensionService {
    pool: MySqlPool,
    ols: OlsConfig,
    php: PhpConfig,
    runner: Arc<dyn ProcessRunner>,
    locks: Arc<LockRegistry>,
    audit: Arc<dyn AuditLogger>,
}

impl ExtensionService {
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

    /// Catalog merged with the live `php -m` module list.
    pub async fn list(&self) -> Result<ExtensionList, PhpExtError> {
        let rows = queries::list_extensions(&self.pool).await?;
        let loaded = self.loaded_modules().await;

        let mut installed = 0;
        let mut enabled = 0;
        let extensions: Vec<ExtensionStatus> = rows
            .into_iter()
            .map(|extension| {
                let live = module_is_loaded(&loaded, &extension.name);
                if extension.installed || live {
                    installed += 1;
                }
                if extension.enabled {
                    enabled += 1;
                }
                ExtensionStatus { extension, live }
            })
            .collect();

        Ok(ExtensionList {
            total: extensions.len(),
            installed,
            enabled,
            extensions,
            php_version: self.php.version.clone(),
            php_ini_path: self.php.ini_path.to_string_lossy().into_owned(),
        })
    }

    /// Install an extension package and mark it installed + enabled.
    pub async fn install(
        &self,
        identity: &RequestIdentity,
        name: &str,
    ) -> Result<InstallOutcome, PhpExtError> {
        if name.is_empty() {
            return Err(PhpExtError::Validation(
                "Extension name is required".to_string(),
            ));
        }
        let name = input::validate_extension_name(name)
            .map_err(|_| PhpExtError::Validation("Invalid extension name".to_string()))?;
        match queries::get_extension(&self.pool, name).await {
            Ok(_) => {}
            Err(DbError::NotFound(_)) => {
                return Err(PhpExtError::Validation("Invalid extension name".to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        let _guard = self.locks.acquire(&locks::extension_key(name)).await;

        let output = if name == "ioncube" {
            self.install_ioncube().await?
        } else {
            let package = APT_PACKAGES
                .iter()
                .find(|(ext, _)| *ext == name)
                .map(|(_, pkg)| *pkg)
                .ok_or_else(|| {
                    PhpExtError::Validation(
                        "No installation command available for this extension".to_string(),
                    )
                })?;
            let spec = CommandSpec::new("apt-get")
                .arg("install")
                .arg("-y")
                .arg(format!("lsphp{}-{package}", self.php.version))
                .env("DEBIAN_FRONTEND", "noninteractive")
                .elevated()
                .timeout(INSTALL_TIMEOUT);
            let result = self
                .runner
                .run(&spec)
                .await
                .map_err(|e| PhpExtError::External(e.to_string()))?;
            if !result.success() {
                self.audit
                    .log_event(
                        &identity
                            .event(AuditAction::ExtensionInstall, "php_extension")
                            .result(AuditResult::Failed)
                            .details(serde_json::json!({
                                "extension": name,
                                "error": result.output.trim(),
                            })),
                    )
                    .await;
                return Err(PhpExtError::External(format!(
                    "Failed to install extension {name}"
                )));
            }
            result.output
        };

        if name == "ioncube" {
            let _ini_guard = self.locks.acquire(locks::PHP_INI_KEY).await;
            self.append_ioncube_ini_line()?;
        }

        queries::mark_extension_installed(&self.pool, name).await?;
        if let Err(e) = self.reload_ols().await {
            warn!(extension = name, error = %e, "Extension installed but reload failed");
        }

        info!(extension = name, "Installed PHP extension");
        self.audit
            .log_event(
                &identity
                    .event(AuditAction::ExtensionInstall, "php_extension")
                    .details(serde_json::json!({ "extension": name })),
            )
            .await;

        Ok(InstallOutcome {
            extension: name.to_string(),
            output: output.trim().to_string(),
        })
    }

    /// Flip the desired flag. Enabling requires the extension to be
    /// installed first.
    pub async fn toggle(
        &self,
        identity: &RequestIdentity,
        name: &str,
    ) -> Result<ToggleOutcome, PhpExtError> {
        if name.is_empty() {
            return Err(PhpExtError::Validation(
                "Extension name is required".to_string(),
            ));
        }
        let name = input::validate_extension_name(name)
            .map_err(|_| PhpExtError::Validation("Invalid extension name".to_string()))?;
        let row = match queries::get_extension(&self.pool, name).await {
            Ok(row) => row,
            Err(DbError::NotFound(_)) => {
                return Err(PhpExtError::Validation("Invalid extension name".to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let enabled = !row.enabled;
        if enabled && !row.installed {
            return Err(PhpExtError::Validation(
                "Extension is not installed".to_string(),
            ));
        }
        queries::set_extension_desired(&self.pool, name, enabled).await?;

        self.audit
            .log_event(
                &identity
                    .event(AuditAction::ExtensionToggle, "php_extension")
                    .details(serde_json::json!({ "extension": name, "enabled": enabled })),
            )
            .await;

        Ok(ToggleOutcome {
            extension: name.to_string(),
            enabled,
        })
    }

    /// Bulk-apply a desired extension selection: catalog transaction,
    /// php.ini rewrite with a timestamped backup, then reload. A failed
    /// reload keeps the desired state and reports `reloaded: false`.
    pub async fn apply_changes(
        &self,
        identity: &RequestIdentity,
        selected: &[String],
    ) -> Result<ApplyOutcome, PhpExtError> {
        for name in selected {
            input::validate_extension_name(name)
                .map_err(|_| PhpExtError::Validation("Invalid extension name".to_string()))?;
        }

        let _ini_guard = self.locks.acquire(locks::PHP_INI_KEY).await;

        queries::apply_extension_selection(&self.pool, selected).await?;
        let enabled: Vec<PhpExtension> = queries::list_extensions(&self.pool)
            .await?
            .into_iter()
            .filter(|row| row.enabled)
            .collect();

        self.rewrite_ini_extensions(&enabled)?;

        let reloaded = match self.reload_ols().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Extension selection applied but reload failed");
                self.audit
                    .log_event(
                        &identity
                            .event(AuditAction::ExtensionUpdate, "php_extension")
                            .result(AuditResult::Warning)
                            .details(serde_json::json!({
                                "drift": "php.ini updated, reload failed",
                                "error": e.to_string(),
                            })),
                    )
                    .await;
                false
            }
        };

        let enabled_extensions: Vec<String> =
            enabled.into_iter().map(|row| row.name).collect();
        info!(
            count = enabled_extensions.len(),
            reloaded, "Applied PHP extension selection"
        );
        if reloaded {
            self.audit
                .log_event(
                    &identity
                        .event(AuditAction::ExtensionUpdate, "php_extension")
                        .details(serde_json::json!({
                            "enabled_extensions": enabled_extensions,
                        })),
                )
                .await;
        }

        Ok(ApplyOutcome {
            total: enabled_extensions.len(),
            enabled_extensions,
            reloaded,
        })
    }

    /// Raw php.ini plus a summary of the commonly edited keys.
    pub async fn get_config(&self) -> Result<PhpConfigView, PhpExtError> {
        if !self.php.ini_path.exists() {
            return Err(PhpExtError::IniNotFound);
        }
        let config = std::fs::read_to_string(&self.php.ini_path)
            .map_err(|e| PhpExtError::Config(e.to_string()))?;
        let ini = IniFile::parse(&config);
        let settings = SUMMARY_KEYS
            .iter()
            .filter_map(|key| ini.get(key).map(|value| (key.to_string(), value.to_string())))
            .collect();
        Ok(PhpConfigView {
            config,
            settings,
            ini_path: self.php.ini_path.to_string_lossy().into_owned(),
        })
    }

    /// Replace php.ini wholesale, keeping a timestamped backup.
    pub async fn save_config(
        &self,
        identity: &RequestIdentity,
        content: &str,
    ) -> Result<SaveConfigOutcome, PhpExtError> {
        if content.trim().is_empty() {
            return Err(PhpExtError::Validation(
                "Configuration is required".to_string(),
            ));
        }

        let _ini_guard = self.locks.acquire(locks::PHP_INI_KEY).await;
        let backup = atomic::atomic_write_with_timestamped_backup(
            &self.php.ini_path,
            content.as_bytes(),
            Some(0o644),
        )
        .map_err(|e| PhpExtError::Config(e.to_string()))?;

        let reloaded = match self.reload_ols().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "php.ini saved but reload failed");
                false
            }
        };

        info!("Saved php.ini");
        self.audit
            .log_event(
                &identity
                    .event(AuditAction::PhpConfigSave, "php_config")
                    .details(serde_json::json!({ "reloaded": reloaded })),
            )
            .await;

        Ok(SaveConfigOutcome {
            saved: true,
            backup: backup.map(|path| path.to_string_lossy().into_owned()),
            reloaded,
        })
    }

    /// Restart the web server so PHP picks up configuration changes.
    pub async fn reload(&self, identity: &RequestIdentity) -> Result<(), PhpExtError> {
        self.reload_ols().await?;
        self.audit
            .log_event(&identity.event(AuditAction::PhpReload, "php_config"))
            .await;
        Ok(())
    }

    /// Regenerate the `extension=` lines from the enabled set.
    fn rewrite_ini_extensions(&self, enabled: &[PhpExtension]) -> Result<(), PhpExtError> {
        let content = std::fs::read_to_string(&self.php.ini_path)
            .map_err(|_| PhpExtError::IniNotFound)?;
        let mut ini = IniFile::parse(&content);
        ini.strip_extension_lines();

        let lines: Vec<String> = enabled
            .iter()
            .map(|row| {
                if row.name == "ioncube" {
                    format!(
                        "zend_extension = {}",
                        self.ioncube_loader_path().to_string_lossy()
                    )
                } else {
                    format!("extension = {}.so", row.name)
                }
            })
            .collect();
        ini.insert_extension_lines(&lines);

        atomic::atomic_write_with_timestamped_backup(
            &self.php.ini_path,
            ini.serialize().as_bytes(),
            Some(0o644),
        )
        .map_err(|e| PhpExtError::Config(e.to_string()))?;
        Ok(())
    }

    /// Download the ionCube loader and drop its `.so` into the Zend
    /// extension directory. The loader has no apt package.
    async fn install_ioncube(&self) -> Result<String, PhpExtError> {
        let tarball = PathBuf::from("/tmp/ioncube_loaders.tar.gz");
        let download = CommandSpec::new("wget")
            .arg("-q")
            .arg("-O")
            .arg(tarball.to_string_lossy().into_owned())
            .arg(IONCUBE_URL)
            .timeout(INSTALL_TIMEOUT);
        let output = self
            .runner
            .run(&download)
            .await
            .map_err(|e| PhpExtError::External(e.to_string()))?;
        if !output.success() {
            return Err(PhpExtError::External(
                "Failed to download ionCube loader".to_string(),
            ));
        }

        let unpack_dir = PathBuf::from("/tmp/ioncube_unpack");
        archive::extract_tar_gz(&tarball, &unpack_dir)
            .map_err(|e| PhpExtError::External(format!("Failed to unpack ionCube loader: {e}")))?;

        let loader_name = self.ioncube_loader_name();
        let source = unpack_dir.join("ioncube").join(&loader_name);
        let dest = self.ioncube_loader_path();
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PhpExtError::External(e.to_string()))?;
        }
        std::fs::copy(&source, &dest)
            .map_err(|e| PhpExtError::External(format!("Failed to install loader: {e}")))?;

        let _ = std::fs::remove_file(&tarball);
        let _ = std::fs::remove_dir_all(&unpack_dir);

        Ok(format!("Installed {loader_name}"))
    }

    /// Add the `zend_extension` line for the loader unless one is
    /// already configured. Caller holds the php.ini lock.
    fn append_ioncube_ini_line(&self) -> Result<(), PhpExtError> {
        let content = std::fs::read_to_string(&self.php.ini_path)
            .map_err(|_| PhpExtError::IniNotFound)?;
        let mut ini = IniFile::parse(&content);
        let already = ini
            .extension_values()
            .iter()
            .any(|value| value.contains("ioncube"));
        if already {
            return Ok(());
        }
        let line = format!(
            "zend_extension = {}",
            self.ioncube_loader_path().to_string_lossy()
        );
        ini.insert_extension_lines(&[line]);
        atomic::atomic_write_with_timestamped_backup(
            &self.php.ini_path,
            ini.serialize().as_bytes(),
            Some(0o644),
        )
        .map_err(|e| PhpExtError::Config(e.to_string()))?;
        Ok(())
    }

    fn ioncube_loader_name(&self) -> String {
        format!("ioncube_loader_lin_{}.so", dotted_php_version(&self.php.version))
    }

    fn ioncube_loader_path(&self) -> PathBuf {
        self.php.zend_extension_dir().join(self.ioncube_loader_name())
    }

    async fn reload_ols(&self) -> Result<(), PhpExtError> {
        let spec = CommandSpec::new(self.ols.control_bin.to_string_lossy().into_owned())
            .arg("restart")
            .elevated();
        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| PhpExtError::External(e.to_string()))?;
        if !output.success() {
            return Err(PhpExtError::External(format!(
                "OpenLiteSpeed restart failed: {}",
                output.output.trim()
            )));
        }
        Ok(())
    }

    /// Module names from `php -m`, lowercased. Empty set if PHP is
    /// unavailable.
    async fn loaded_modules(&self) -> HashSet<String> {
        let spec = CommandSpec::new(self.php.php_bin().to_string_lossy().into_owned()).arg("-m");
        match self.runner.run(&spec).await {
            Ok(output) if output.success() => parse_php_modules(&output.output),
            _ => HashSet::new(),
        }
    }
}

/// Parse `php -m` output into a lowercase module set, skipping the
/// `[PHP Modules]` / `[Zend Modules]` section headers.
fn parse_php_modules(output: &str) -> HashSet<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('['))
        .map(str::to_lowercase)
        .collect()
}

fn module_is_loaded(loaded: &HashSet<String>, name: &str) -> bool {
    if loaded.contains(&name.to_lowercase()) {
        return true;
    }
    // The loader reports itself as "the ionCube PHP Loader".
    name == "ioncube" && loaded.iter().any(|module| module.contains("ioncube"))
}

/// "83" -> "8.3"; values that already carry a dot pass through.
fn dotted_php_version(version: &str) -> String {
    if version.contains('.') || version.len() < 2 {
        return version.to_string();
    }
    format!("{}.{}", &version[..1], &version[1..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_php_modules_skips_headers() {
        let output = "[PHP Modules]\ncurl\ngd\nmbstring\n\n[Zend Modules]\nZend OPcache\nthe ionCube PHP Loader\n";
        let modules = parse_php_modules(output);
        assert!(modules.contains("curl"));
        assert!(modules.contains("zend opcache"));
        assert!(!modules.contains("[php modules]"));
    }

    #[test]
    fn test_module_is_loaded_handles_ioncube_alias() {
        let loaded = parse_php_modules("[Zend Modules]\nthe ionCube PHP Loader\n");
        assert!(module_is_loaded(&loaded, "ioncube"));
        assert!(!module_is_loaded(&loaded, "redis"));
    }

    #[test]
    fn test_dotted_php_version() {
        assert_eq!(dotted_php_version("83"), "8.3");
        assert_eq!(dotted_php_version("74"), "7.4");
        assert_eq!(dotted_php_version("8.3"), "8.3");
    }
}
