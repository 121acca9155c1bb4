//! Backup creation, restore, and retention.
//!
//! Database dumps run through `mysqldump` with the password passed via
//! `MYSQL_PWD` (redacted in logs), then gzipped; archive backups tar.gz
//! the docroot and config directory sets. Every artifact gets a catalog
//! row with an expiry stamp that the retention sweep acts on.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::MySqlPool;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{error, info, warn};

use lp_core::config::{BackupConfig, OlsConfig};
use lp_core::fs::archive::{compress_file, create_tar_gz, decompress_file};
use lp_core::process::{CommandSpec, ProcessRunner};
use lp_core::security::audit::{AuditAction, AuditLogger, AuditResult};
use lp_core::security::input;
use lp_db::models::{Backup, NewBackup};
use lp_db::pool::DbCredentials;
use lp_db::queries;
use lp_db::DbError;

use crate::context::RequestIdentity;
use crate::locks::{LockRegistry, BACKUP_KEY};

/// Backup types with their storage subdirectory.
const BACKUP_TYPES: &[(&str, &str)] = &[
    ("database", "database"),
    ("files", "vhosts"),
    ("config", "config"),
    ("full", "full"),
];

const DUMP_TIMEOUT: StdDuration = StdDuration::from_secs(600);
const RESTORE_TIMEOUT: StdDuration = StdDuration::from_secs(600);

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("{0}")]
    Validation(String),
    #[error("Backup not found")]
    NotFound,
    /// The artifact exists on disk but the catalog row does not.
    #[error("{0}")]
    Partial(String),
    #[error("{0}")]
    External(String),
    #[error("Database error: {0}")]
    Database(#[from] DbError),
}

/// Catalog row plus whether the artifact is still on disk.
#[derive(Debug, Serialize)]
pub struct BackupEntry {
    #[serde(flatten)]
    pub backup: Backup,
    pub file_exists: bool,
}

#[derive(Debug, Serialize)]
pub struct BackupList {
    pub backups: Vec<BackupEntry>,
    pub total: usize,
    pub total_size: i64,
}

#[derive(Debug, Serialize)]
pub struct CreatedBackup {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub backup_type: String,
    pub path: String,
    pub size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct RestoredBackup {
    pub id: i64,
    pub database: String,
}

#[derive(Debug, Serialize)]
pub struct TypeStatistics {
    pub count: i64,
    pub size: i64,
}

#[derive(Debug, Serialize)]
pub struct BackupStatistics {
    pub total_count: i64,
    pub total_size: i64,
    pub by_type: std::collections::BTreeMap<String, TypeStatistics>,
    pub retention_days: i64,
}

pub struct BackupService {
    pool: MySqlPool,
    config: BackupConfig,
    ols: OlsConfig,
    credentials: DbCredentials,
    runner: Arc<dyn ProcessRunner>,
    locks: Arc<LockRegistry>,
    audit: Arc<dyn AuditLogger>,
}

impl BackupService {
    pub fn new(
        pool: MySqlPool,
        config: BackupConfig,
        ols: OlsConfig,
        credentials: DbCredentials,
        runner: Arc<dyn ProcessRunner>,
        locks: Arc<LockRegistry>,
        audit: Arc<dyn AuditLogger>,
    ) -> Self {
        Self {
            pool,
            config,
            ols,
            credentials,
            runner,
            locks,
            audit,
        }
    }

    /// Dump one database to `{root}/database/{db}_{stamp}.sql.gz`.
    ///
    /// A gzip failure keeps and catalogs the plain `.sql` artifact
    /// rather than discarding a good dump.
    pub async fn create_database_backup(
        &self,
        identity: &RequestIdentity,
        database: &str,
    ) -> Result<CreatedBackup, BackupError> {
        let created_by = identity
            .user_id
            .ok_or_else(|| BackupError::Validation("Authentication required".to_string()))?;
        let database = input::validate_database_name(database)
            .map_err(|e| BackupError::Validation(e.to_string()))?;

        let _guard = self.locks.acquire(BACKUP_KEY).await;

        let dir = self.type_dir("database");
        std::fs::create_dir_all(&dir)
            .map_err(|e| BackupError::External(format!("Failed to create backup directory: {e}")))?;

        let name = backup_filename(database, Utc::now());
        let sql_path = dir.join(&name);

        let spec = CommandSpec::new("mysqldump")
            .arg("-h")
            .arg(&self.credentials.host)
            .arg("-P")
            .arg(self.credentials.port.to_string())
            .arg("-u")
            .arg(&self.credentials.username)
            .arg("--single-transaction")
            .arg("--quick")
            .arg("--lock-tables=false")
            .arg(database)
            .secret_env("MYSQL_PWD", &self.credentials.password)
            .stdout_file(&sql_path)
            .timeout(DUMP_TIMEOUT);

        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| BackupError::External(e.to_string()))?;
        if !output.success() {
            let _ = std::fs::remove_file(&sql_path);
            self.audit
                .log_event(
                    &identity
                        .event(AuditAction::DatabaseBackup, "backup")
                        .result(AuditResult::Failed)
                        .details(serde_json::json!({
                            "database": database,
                            "error": output.output.trim(),
                        })),
                )
                .await;
            return Err(BackupError::External(format!(
                "Failed to create database backup: {}",
                output.output.trim()
            )));
        }

        // Compress; a failure here downgrades to the plain dump.
        let gz_path = dir.join(format!("{name}.gz"));
        let (final_path, final_name, size) = match compress_file(&sql_path, &gz_path) {
            Ok(size) => {
                let _ = std::fs::remove_file(&sql_path);
                (gz_path, format!("{name}.gz"), size as i64)
            }
            Err(e) => {
                warn!(error = %e, "Backup compression failed, keeping plain dump");
                let _ = std::fs::remove_file(&gz_path);
                let size = std::fs::metadata(&sql_path).map(|m| m.len()).unwrap_or(0);
                (sql_path, name.clone(), size as i64)
            }
        };

        self.catalog(
            identity,
            AuditAction::DatabaseBackup,
            NewBackup {
                name: final_name,
                backup_type: "database".to_string(),
                path: final_path.display().to_string(),
                size,
                status: "completed".to_string(),
                expires_at: Some(Utc::now() + Duration::days(self.config.retention_days)),
                created_by,
            },
            serde_json::json!({ "database": database }),
        )
        .await
    }

    /// tar.gz one of the archive directory sets.
    pub async fn create_archive_backup(
        &self,
        identity: &RequestIdentity,
        backup_type: &str,
    ) -> Result<CreatedBackup, BackupError> {
        let created_by = identity
            .user_id
            .ok_or_else(|| BackupError::Validation("Authentication required".to_string()))?;
        if !matches!(backup_type, "files" | "config" | "full") {
            return Err(BackupError::Validation(
                "Invalid backup type. Must be: database, files, config, or full".to_string(),
            ));
        }

        let _guard = self.locks.acquire(BACKUP_KEY).await;

        let dir = self.type_dir(backup_type);
        std::fs::create_dir_all(&dir)
            .map_err(|e| BackupError::External(format!("Failed to create backup directory: {e}")))?;

        let name = format!(
            "{}_{}.tar.gz",
            backup_type,
            Utc::now().format("%Y-%m-%d_%H-%M-%S")
        );
        let archive_path = dir.join(&name);
        let sources = self.archive_sources(backup_type);

        let size = tokio::task::spawn_blocking({
            let archive_path = archive_path.clone();
            move || create_tar_gz(&archive_path, &sources)
        })
        .await
        .map_err(|e| BackupError::External(e.to_string()))?
        .map_err(|e| {
            let _ = std::fs::remove_file(&archive_path);
            BackupError::External(format!("Failed to create archive: {e}"))
        })?;

        self.catalog(
            identity,
            AuditAction::BackupCreate,
            NewBackup {
                name,
                backup_type: backup_type.to_string(),
                path: archive_path.display().to_string(),
                size: size as i64,
                status: "completed".to_string(),
                expires_at: Some(Utc::now() + Duration::days(self.config.retention_days)),
                created_by,
            },
            serde_json::json!({ "type": backup_type }),
        )
        .await
    }

    /// Feed a database dump back through the `mysql` client. The target
    /// database defaults to the name encoded in the backup filename.
    pub async fn restore_database(
        &self,
        identity: &RequestIdentity,
        backup_id: i64,
        database: Option<&str>,
    ) -> Result<RestoredBackup, BackupError> {
        let backup = self.get(backup_id).await?;
        if backup.backup_type != "database" {
            return Err(BackupError::Validation(
                "Only database backups can be restored".to_string(),
            ));
        }
        let path = PathBuf::from(&backup.path);
        if !path.exists() {
            return Err(BackupError::External("Backup file not found".to_string()));
        }

        let target = match database {
            Some(name) => name.to_string(),
            None => database_from_backup_name(&backup.name).ok_or_else(|| {
                BackupError::Validation(
                    "Could not determine target database from the backup name".to_string(),
                )
            })?,
        };
        let target = input::validate_database_name(&target)
            .map_err(|e| BackupError::Validation(e.to_string()))?
            .to_string();

        let _guard = self.locks.acquire(BACKUP_KEY).await;

        // Temp file is unlinked on every exit path once this binding drops.
        let decompressed: Option<NamedTempFile>;
        let input_path: PathBuf;
        if backup.path.ends_with(".gz") {
            let temp = NamedTempFile::new()
                .map_err(|e| BackupError::External(format!("Failed to create temp file: {e}")))?;
            decompress_file(&path, temp.path())
                .map_err(|e| BackupError::External(format!("Failed to decompress backup: {e}")))?;
            input_path = temp.path().to_path_buf();
            decompressed = Some(temp);
        } else {
            input_path = path;
            decompressed = None;
        }

        queries::create_database_ddl(&self.pool, &target, "utf8mb4", "utf8mb4_unicode_ci").await?;

        let spec = CommandSpec::new("mysql")
            .arg("-h")
            .arg(&self.credentials.host)
            .arg("-P")
            .arg(self.credentials.port.to_string())
            .arg("-u")
            .arg(&self.credentials.username)
            .arg(&target)
            .secret_env("MYSQL_PWD", &self.credentials.password)
            .stdin_file(&input_path)
            .timeout(RESTORE_TIMEOUT);

        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| BackupError::External(e.to_string()))?;
        drop(decompressed);
        if !output.success() {
            self.audit
                .log_event(
                    &identity
                        .event(AuditAction::DatabaseRestore, "backup")
                        .entity_id(backup_id)
                        .result(AuditResult::Failed)
                        .details(serde_json::json!({
                            "database": target,
                            "error": output.output.trim(),
                        })),
                )
                .await;
            return Err(BackupError::External(format!(
                "Failed to restore database backup: {}",
                output.output.trim()
            )));
        }

        info!(backup_id, database = %target, "Restored database backup");
        self.audit
            .log_event(
                &identity
                    .event(AuditAction::DatabaseRestore, "backup")
                    .entity_id(backup_id)
                    .details(serde_json::json!({ "database": target })),
            )
            .await;

        Ok(RestoredBackup {
            id: backup_id,
            database: target,
        })
    }

    pub async fn list(&self) -> Result<BackupList, BackupError> {
        let backups = queries::list_backups(&self.pool).await?;
        let entries: Vec<BackupEntry> = backups
            .into_iter()
            .map(|backup| BackupEntry {
                file_exists: Path::new(&backup.path).exists(),
                backup,
            })
            .collect();
        let total_size = entries.iter().map(|e| e.backup.size).sum();

        Ok(BackupList {
            total: entries.len(),
            total_size,
            backups: entries,
        })
    }

    pub async fn get(&self, id: i64) -> Result<Backup, BackupError> {
        match queries::get_backup(&self.pool, id).await {
            Ok(backup) => Ok(backup),
            Err(DbError::NotFound(_)) => Err(BackupError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the artifact, then the row. An undeletable file keeps the
    /// row so the backup stays visible.
    pub async fn delete(&self, identity: &RequestIdentity, id: i64) -> Result<(), BackupError> {
        let backup = self.get(id).await?;
        let _guard = self.locks.acquire(BACKUP_KEY).await;

        if let Err(e) = std::fs::remove_file(&backup.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(BackupError::External(format!(
                    "Failed to delete backup file: {e}"
                )));
            }
        }
        queries::delete_backup_row(&self.pool, id).await?;

        info!(id, name = %backup.name, "Deleted backup");
        self.audit
            .log_event(
                &identity
                    .event(AuditAction::BackupDelete, "backup")
                    .entity_id(id)
                    .details(serde_json::json!({ "name": backup.name })),
            )
            .await;
        Ok(())
    }

    /// Retention sweep: drop every expired artifact and row. Returns the
    /// number removed.
    pub async fn cleanup_expired(&self) -> Result<u64, BackupError> {
        let expired = queries::list_expired_backups(&self.pool).await?;
        if expired.is_empty() {
            return Ok(0);
        }

        let _guard = self.locks.acquire(BACKUP_KEY).await;
        let mut removed = 0u64;
        for backup in expired {
            if let Err(e) = std::fs::remove_file(&backup.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    error!(id = backup.id, path = %backup.path, error = %e,
                           "Failed to remove expired backup file");
                    continue;
                }
            }
            if let Err(e) = queries::delete_backup_row(&self.pool, backup.id).await {
                error!(id = backup.id, error = %e, "Failed to remove expired backup row");
                continue;
            }
            removed += 1;
        }

        if removed > 0 {
            info!(removed, "Retention removed expired backups");
            self.audit
                .log_event(
                    &RequestIdentity::default()
                        .event(AuditAction::BackupDelete, "backup")
                        .details(serde_json::json!({
                            "scope": "retention",
                            "removed": removed,
                        })),
                )
                .await;
        }
        Ok(removed)
    }

    pub async fn statistics(&self) -> Result<BackupStatistics, BackupError> {
        let rows = queries::backup_statistics(&self.pool).await?;
        let mut by_type = std::collections::BTreeMap::new();
        let mut total_count = 0;
        let mut total_size = 0;
        for (backup_type, count, size) in rows {
            total_count += count;
            total_size += size;
            by_type.insert(backup_type, TypeStatistics { count, size });
        }

        Ok(BackupStatistics {
            total_count,
            total_size,
            by_type,
            retention_days: self.config.retention_days,
        })
    }

    fn type_dir(&self, backup_type: &str) -> PathBuf {
        let subdir = BACKUP_TYPES
            .iter()
            .find(|(t, _)| *t == backup_type)
            .map(|(_, dir)| *dir)
            .unwrap_or(backup_type);
        self.config.root.join(subdir)
    }

    fn archive_sources(&self, backup_type: &str) -> Vec<PathBuf> {
        let files = vec![self.ols.default_docroot.clone()];
        let config = vec![
            self.ols.server_root.join("conf"),
            PathBuf::from("/etc/litepanel"),
        ];
        match backup_type {
            "files" => files,
            "config" => config,
            _ => files.into_iter().chain(config).collect(),
        }
    }

    /// Insert the catalog row for an artifact already on disk.
    async fn catalog(
        &self,
        identity: &RequestIdentity,
        action: AuditAction,
        backup: NewBackup,
        details: serde_json::Value,
    ) -> Result<CreatedBackup, BackupError> {
        let id = match queries::insert_backup(&self.pool, &backup).await {
            Ok(id) => id,
            Err(e) => {
                error!(name = %backup.name, error = %e, "Backup created but catalog insert failed");
                self.audit
                    .log_event(
                        &identity
                            .event(action, "backup")
                            .result(AuditResult::Warning)
                            .details(serde_json::json!({
                                "name": backup.name,
                                "drift": "artifact on disk, missing from panel",
                                "error": e.to_string(),
                            })),
                    )
                    .await;
                return Err(BackupError::Partial(
                    "Backup created but failed to save to database".to_string(),
                ));
            }
        };

        info!(id, name = %backup.name, size = backup.size, "Created backup");
        let mut details = details;
        details["name"] = backup.name.clone().into();
        self.audit
            .log_event(
                &identity
                    .event(action, "backup")
                    .entity_id(id)
                    .details(details),
            )
            .await;

        Ok(CreatedBackup {
            id,
            name: backup.name,
            backup_type: backup.backup_type,
            path: backup.path,
            size: backup.size,
            expires_at: backup.expires_at,
        })
    }
}

/// `{db}_{Y-m-d_H-i-s}.sql`
fn backup_filename(database: &str, now: DateTime<Utc>) -> String {
    format!("{database}_{}.sql", now.format("%Y-%m-%d_%H-%M-%S"))
}

/// Recover the database name from a `{db}_{date}_{time}.sql[.gz]`
/// filename. Underscores inside the database name survive because only
/// the two trailing stamp segments are stripped.
fn database_from_backup_name(name: &str) -> Option<String> {
    let stem = name.strip_suffix(".gz").unwrap_or(name);
    let stem = stem.strip_suffix(".sql")?;
    let mut parts = stem.rsplitn(3, '_');
    let _time = parts.next()?;
    let _date = parts.next()?;
    let database = parts.next()?;
    if database.is_empty() {
        None
    } else {
        Some(database.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_backup_filename_format() {
        let stamp = Utc.with_ymd_and_hms(2026, 8, 25, 14, 30, 5).unwrap();
        assert_eq!(
            backup_filename("appdb", stamp),
            "appdb_2026-08-25_14-30-05.sql"
        );
    }

    #[test]
    fn test_database_from_backup_name() {
        assert_eq!(
            database_from_backup_name("appdb_2026-08-25_14-30-05.sql.gz").as_deref(),
            Some("appdb")
        );
        assert_eq!(
            database_from_backup_name("appdb_2026-08-25_14-30-05.sql").as_deref(),
            Some("appdb")
        );
        // Underscores in the database name survive.
        assert_eq!(
            database_from_backup_name("my_app_db_2026-08-25_14-30-05.sql.gz").as_deref(),
            Some("my_app_db")
        );
        assert_eq!(database_from_backup_name("notadump.txt"), None);
    }

    #[test]
    fn test_type_dir_mapping() {
        assert_eq!(
            BACKUP_TYPES.iter().find(|(t, _)| *t == "files").unwrap().1,
            "vhosts"
        );
        assert_eq!(
            BACKUP_TYPES
                .iter()
                .find(|(t, _)| *t == "database")
                .unwrap()
                .1,
            "database"
        );
    }
}
