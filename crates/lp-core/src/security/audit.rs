//! Audit event types and logging backends.
//!
//! Every administrative action (login, vhost change, firewall edit,
//! backup, ...) is recorded as a structured event. The primary sink is
//! the `system_logs` table (implemented in `lp-services`); this module
//! defines the event shape, the logger trait, and the file-based backends
//! used as a fallback and in tests.
//!
//! # Contract
//!
//! Audit logging never fails the audited operation. Implementations log
//! persistence problems via `tracing` and drop the event if they must.
//!
//! # File format
//!
//! [`FileAuditLogger`] writes one JSON object per line (JSON Lines) and
//! rotates the file with a timestamp suffix when it exceeds 10 MB.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

/// Maximum audit log file size before rotation (10 MB).
const MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

/// Errors that can occur during audit file operations.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Administrative actions tracked by the audit system.
///
/// Serialized in `snake_case`; the same strings land in the
/// `system_logs.action` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Login,
    LoginFailed,
    Logout,
    Register,
    PasswordChange,
    PasswordResetRequest,
    VhostCreate,
    VhostUpdate,
    VhostDelete,
    SslIssue,
    SslRenew,
    SslRemove,
    DatabaseCreate,
    DatabaseDelete,
    DbUserCreate,
    DbUserDelete,
    DatabaseBackup,
    DatabaseRestore,
    DatabaseImport,
    DatabaseExport,
    ExtensionInstall,
    ExtensionToggle,
    ExtensionUpdate,
    PhpConfigSave,
    PhpReload,
    FirewallAdd,
    FirewallDelete,
    FirewallToggle,
    FirewallControl,
    RedisControl,
    RedisConfigUpdate,
    RedisFlush,
    BackupCreate,
    BackupDelete,
    ServiceControl,
    SettingsUpdate,
    /// One external command invocation, recorded by the process runner.
    CommandRun,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Login => "login",
            Self::LoginFailed => "login_failed",
            Self::Logout => "logout",
            Self::Register => "register",
            Self::PasswordChange => "password_change",
            Self::PasswordResetRequest => "password_reset_request",
            Self::VhostCreate => "vhost_create",
            Self::VhostUpdate => "vhost_update",
            Self::VhostDelete => "vhost_delete",
            Self::SslIssue => "ssl_issue",
            Self::SslRenew => "ssl_renew",
            Self::SslRemove => "ssl_remove",
            Self::DatabaseCreate => "database_create",
            Self::DatabaseDelete => "database_delete",
            Self::DbUserCreate => "db_user_create",
            Self::DbUserDelete => "db_user_delete",
            Self::DatabaseBackup => "database_backup",
            Self::DatabaseRestore => "database_restore",
            Self::DatabaseImport => "database_import",
            Self::DatabaseExport => "database_export",
            Self::ExtensionInstall => "extension_install",
            Self::ExtensionToggle => "extension_toggle",
            Self::ExtensionUpdate => "extension_update",
            Self::PhpConfigSave => "php_config_save",
            Self::PhpReload => "php_reload",
            Self::FirewallAdd => "firewall_add",
            Self::FirewallDelete => "firewall_delete",
            Self::FirewallToggle => "firewall_toggle",
            Self::FirewallControl => "firewall_control",
            Self::RedisControl => "redis_control",
            Self::RedisConfigUpdate => "redis_config_update",
            Self::RedisFlush => "redis_flush",
            Self::BackupCreate => "backup_create",
            Self::BackupDelete => "backup_delete",
            Self::ServiceControl => "service_control",
            Self::SettingsUpdate => "settings_update",
            Self::CommandRun => "command_run",
        };
        write!(f, "{}", s)
    }
}

/// The outcome of an audited operation.
///
/// `Warning` marks partial success, e.g. an external mutation that
/// succeeded while the matching panel record write failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Success,
    Failed,
    Warning,
}

impl fmt::Display for AuditResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Warning => write!(f, "warning"),
        }
    }
}

/// A single audit event capturing an administrative action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC).
    pub timestamp: DateTime<Utc>,
    /// What action was performed.
    pub action: AuditAction,
    /// Panel user who performed it, if authenticated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    /// The kind of object acted on ("vhost", "database", "firewall", ...).
    pub entity: String,
    /// Row id of the object, when it has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<i64>,
    /// Whether the action succeeded, failed, or partially succeeded.
    pub result: AuditResult,
    /// Free-form structured context (never secrets).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// Resolved client address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    /// Client User-Agent header.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl AuditEvent {
    /// Create a successful event for `action` on `entity` with the current
    /// UTC timestamp. Refine with the builder methods.
    pub fn new(action: AuditAction, entity: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            user_id: None,
            entity: entity.into(),
            entity_id: None,
            result: AuditResult::Success,
            details: None,
            ip_address: None,
            user_agent: None,
        }
    }

    pub fn user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn entity_id(mut self, id: i64) -> Self {
        self.entity_id = Some(id);
        self
    }

    pub fn result(mut self, result: AuditResult) -> Self {
        self.result = result;
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn client(mut self, ip: impl Into<String>, user_agent: Option<String>) -> Self {
        self.ip_address = Some(ip.into());
        self.user_agent = user_agent;
        self
    }

    /// Shorthand for a failed event carrying the error text in `details`.
    pub fn failed(action: AuditAction, entity: impl Into<String>, error: impl fmt::Display) -> Self {
        Self::new(action, entity)
            .result(AuditResult::Failed)
            .details(serde_json::json!({ "error": error.to_string() }))
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} on {} ({})",
            self.timestamp.to_rfc3339(),
            self.action,
            self.entity,
            self.result,
        )?;
        if let Some(user_id) = self.user_id {
            write!(f, " by user {}", user_id)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// AuditLogger trait
// ---------------------------------------------------------------------------

/// Trait for audit log backends.
///
/// Implementations must be safe to call from multiple tasks and must not
/// propagate persistence failures to the caller.
#[async_trait]
pub trait AuditLogger: Send + Sync {
    /// Record an audit event, best effort.
    async fn log_event(&self, event: &AuditEvent);
}

// ---------------------------------------------------------------------------
// FileAuditLogger
// ---------------------------------------------------------------------------

/// Audit logger that writes JSON Lines to a file.
///
/// Thread-safe via an internal `Mutex`. Rotates the file with a timestamp
/// suffix when it exceeds [`MAX_LOG_SIZE`]. Writes are small appends, so
/// they run inline rather than on the blocking pool.
pub struct FileAuditLogger {
    log_path: PathBuf,
    /// `None` if the file could not be opened; reopened lazily.
    writer: Mutex<Option<BufWriter<File>>>,
}

impl FileAuditLogger {
    /// Create a new `FileAuditLogger` writing to the given path.
    ///
    /// The file is opened in append mode. The parent directory is created
    /// if it does not exist.
    pub fn new(log_path: &Path) -> Result<Self, AuditError> {
        if let Some(parent) = log_path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
                info!(path = %parent.display(), "Created audit log directory");
            }
        }

        let file = Self::open_log_file(log_path)?;
        Ok(Self {
            log_path: log_path.to_path_buf(),
            writer: Mutex::new(Some(BufWriter::new(file))),
        })
    }

    /// Rotate the log file if it exceeds the size limit.
    ///
    /// The current file is renamed to `<path>.<timestamp>` and a new file
    /// is opened. Returns `true` if rotation occurred.
    fn maybe_rotate(&self, guard: &mut Option<BufWriter<File>>) -> Result<bool, AuditError> {
        let metadata = match fs::metadata(&self.log_path) {
            Ok(m) => m,
            Err(_) => return Ok(false),
        };

        if metadata.len() < MAX_LOG_SIZE {
            return Ok(false);
        }

        if let Some(ref mut w) = guard {
            let _ = w.flush();
        }
        *guard = None;

        let timestamp = Utc::now().format("%Y%m%dT%H%M%SZ");
        let rotated_path = PathBuf::from(format!("{}.{}", self.log_path.display(), timestamp));

        fs::rename(&self.log_path, &rotated_path)?;
        info!(
            old = %rotated_path.display(),
            new = %self.log_path.display(),
            "Rotated audit log"
        );

        let file = Self::open_log_file(&self.log_path)?;
        *guard = Some(BufWriter::new(file));
        Ok(true)
    }

    fn open_log_file(path: &Path) -> Result<File, AuditError> {
        Ok(OpenOptions::new().create(true).append(true).open(path)?)
    }

    fn write_event(writer: &mut BufWriter<File>, event: &AuditEvent) -> Result<(), AuditError> {
        let json = serde_json::to_string(event)?;
        writer.write_all(json.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    fn log_event_sync(&self, event: &AuditEvent) {
        let mut guard = match self.writer.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                error!("Audit logger mutex poisoned, recovering");
                poisoned.into_inner()
            }
        };

        if let Err(e) = self.maybe_rotate(&mut guard) {
            warn!(error = %e, "Failed to check/rotate audit log");
        }

        if guard.is_none() {
            match Self::open_log_file(&self.log_path) {
                Ok(file) => *guard = Some(BufWriter::new(file)),
                Err(e) => {
                    error!(error = %e, event = %event, "Failed to open audit log, event lost");
                    return;
                }
            }
        }

        if let Some(ref mut writer) = *guard {
            if let Err(e) = Self::write_event(writer, event) {
                error!(error = %e, event = %event, "Failed to write audit event");
            }
        }
    }
}

#[async_trait]
impl AuditLogger for FileAuditLogger {
    async fn log_event(&self, event: &AuditEvent) {
        self.log_event_sync(event);
    }
}

impl fmt::Debug for FileAuditLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileAuditLogger")
            .field("log_path", &self.log_path)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// NullAuditLogger
// ---------------------------------------------------------------------------

/// An audit logger that discards all events.
#[derive(Debug, Clone)]
pub struct NullAuditLogger;

#[async_trait]
impl AuditLogger for NullAuditLogger {
    async fn log_event(&self, _event: &AuditEvent) {}
}

// ---------------------------------------------------------------------------
// InMemoryAuditLogger (for testing)
// ---------------------------------------------------------------------------

/// An audit logger that stores events in memory, for unit tests that
/// assert on emitted events.
#[derive(Debug, Default)]
pub struct InMemoryAuditLogger {
    events: Mutex<Vec<AuditEvent>>,
}

impl InMemoryAuditLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

#[async_trait]
impl AuditLogger for InMemoryAuditLogger {
    async fn log_event(&self, event: &AuditEvent) {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(event.clone());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_audit_event_builder() {
        let event = AuditEvent::new(AuditAction::VhostCreate, "vhost")
            .user(3)
            .entity_id(17)
            .client("203.0.113.9", Some("curl/8.0".to_string()))
            .details(serde_json::json!({ "domain": "example.com" }));

        assert_eq!(event.action, AuditAction::VhostCreate);
        assert_eq!(event.user_id, Some(3));
        assert_eq!(event.entity, "vhost");
        assert_eq!(event.entity_id, Some(17));
        assert_eq!(event.result, AuditResult::Success);
        assert_eq!(event.ip_address.as_deref(), Some("203.0.113.9"));
        assert_eq!(event.user_agent.as_deref(), Some("curl/8.0"));
    }

    #[test]
    fn test_failed_event_carries_error() {
        let event = AuditEvent::failed(AuditAction::SslIssue, "ssl", "certbot exited with 1");
        assert_eq!(event.result, AuditResult::Failed);
        assert_eq!(
            event.details.unwrap()["error"],
            "certbot exited with 1"
        );
    }

    #[test]
    fn test_audit_event_json_format() {
        let event = AuditEvent::new(AuditAction::Login, "auth");
        let json = serde_json::to_string(&event).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["action"], "login");
        assert_eq!(value["entity"], "auth");
        assert_eq!(value["result"], "success");
        // Optional fields are absent when unset, not null.
        let obj = value.as_object().unwrap();
        assert!(!obj.contains_key("user_id"));
        assert!(!obj.contains_key("details"));
        assert!(!obj.contains_key("ip_address"));
    }

    #[test]
    fn test_action_strings_match_log_rows() {
        assert_eq!(AuditAction::Login.to_string(), "login");
        assert_eq!(AuditAction::LoginFailed.to_string(), "login_failed");
        assert_eq!(AuditAction::VhostCreate.to_string(), "vhost_create");
        assert_eq!(AuditAction::SslIssue.to_string(), "ssl_issue");
        assert_eq!(AuditAction::DbUserCreate.to_string(), "db_user_create");
        assert_eq!(AuditAction::RedisConfigUpdate.to_string(), "redis_config_update");
        assert_eq!(AuditAction::FirewallAdd.to_string(), "firewall_add");
        assert_eq!(AuditAction::SettingsUpdate.to_string(), "settings_update");
    }

    #[test]
    fn test_result_display() {
        assert_eq!(AuditResult::Success.to_string(), "success");
        assert_eq!(AuditResult::Failed.to_string(), "failed");
        assert_eq!(AuditResult::Warning.to_string(), "warning");
    }

    #[tokio::test]
    async fn test_file_logger_writes_json_lines() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("audit.log");
        let logger = FileAuditLogger::new(&log_path).unwrap();

        logger
            .log_event(&AuditEvent::new(AuditAction::VhostCreate, "vhost").user(1))
            .await;
        logger
            .log_event(&AuditEvent::failed(AuditAction::SslIssue, "ssl", "timeout"))
            .await;

        let content = fs::read_to_string(&log_path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: AuditEvent = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.action, AuditAction::VhostCreate);
        assert_eq!(first.user_id, Some(1));

        let second: AuditEvent = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.result, AuditResult::Failed);
    }

    #[tokio::test]
    async fn test_file_logger_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("nested").join("deep").join("audit.log");
        let logger = FileAuditLogger::new(&log_path).unwrap();

        logger
            .log_event(&AuditEvent::new(AuditAction::Login, "auth"))
            .await;
        assert!(log_path.exists());
    }

    #[tokio::test]
    async fn test_file_logger_appends_across_reopens() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("audit.log");

        {
            let logger = FileAuditLogger::new(&log_path).unwrap();
            logger
                .log_event(&AuditEvent::new(AuditAction::Login, "auth"))
                .await;
        }
        {
            let logger = FileAuditLogger::new(&log_path).unwrap();
            logger
                .log_event(&AuditEvent::new(AuditAction::Logout, "auth"))
                .await;
        }

        let content = fs::read_to_string(&log_path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_file_logger_rotation() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("audit.log");
        let logger = FileAuditLogger::new(&log_path).unwrap();

        let big = "x".repeat(10_000);
        let events_needed = (MAX_LOG_SIZE as usize / (big.len() + 200)) + 10;
        for _ in 0..events_needed {
            logger
                .log_event(
                    &AuditEvent::new(AuditAction::SettingsUpdate, "settings")
                        .details(serde_json::json!({ "pad": big })),
                )
                .await;
        }

        assert!(log_path.exists(), "Current log file should exist");
        let rotated: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("audit.log."))
            .collect();
        assert!(!rotated.is_empty(), "At least one rotated log file should exist");
    }

    #[tokio::test]
    async fn test_in_memory_logger() {
        let logger = InMemoryAuditLogger::new();
        assert!(logger.is_empty());

        logger
            .log_event(&AuditEvent::new(AuditAction::FirewallAdd, "firewall"))
            .await;
        logger
            .log_event(&AuditEvent::new(AuditAction::FirewallDelete, "firewall"))
            .await;

        assert_eq!(logger.len(), 2);
        let events = logger.events();
        assert_eq!(events[0].action, AuditAction::FirewallAdd);
        assert_eq!(events[1].action, AuditAction::FirewallDelete);

        logger.clear();
        assert!(logger.is_empty());
    }

    #[tokio::test]
    async fn test_null_logger_discards() {
        let logger = NullAuditLogger;
        logger
            .log_event(&AuditEvent::new(AuditAction::Login, "auth"))
            .await;
    }
}
