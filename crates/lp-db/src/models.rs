use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ============================================================
// Users and sessions
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub email: String,
    pub role: String,
    pub status: String,
    pub login_attempts: i32,
    pub locked_until: Option<DateTime<Utc>>,
    pub last_login: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// User fields safe to return to clients. Never carries the hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicUser {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub role: String,
    pub status: String,
    pub last_login: Option<DateTime<Utc>>,
}

impl From<&User> for PublicUser {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            role: user.role.clone(),
            status: user.status.clone(),
            last_login: user.last_login,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SessionRecord {
    pub token: String,
    pub user_id: i64,
    pub csrf_token: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Long-lived API credential for non-browser clients.
#[derive(Debug, Clone, FromRow)]
pub struct ApiKey {
    pub id: i64,
    pub user_id: i64,
    pub api_key: String,
    pub name: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

// ============================================================
// Virtual hosts
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct VirtualHost {
    pub id: i64,
    pub domain: String,
    pub docroot: String,
    pub email: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub vhost_type: String,
    pub backend_host: Option<String>,
    pub backend_port: Option<i32>,
    pub php_version: String,
    pub ssl_enabled: bool,
    pub ssl_cert: Option<String>,
    pub ssl_key: Option<String>,
    pub ssl_issuer: Option<String>,
    pub ssl_auto_renew: bool,
    pub status: String,
    pub created_by: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert payload for a virtual host; validated by the service first.
#[derive(Debug, Clone)]
pub struct NewVirtualHost {
    pub domain: String,
    pub docroot: String,
    pub email: String,
    pub vhost_type: String,
    pub backend_host: Option<String>,
    pub backend_port: Option<i32>,
    pub php_version: String,
    pub created_by: i64,
}

/// Partial update for a vhost row; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct VhostFieldUpdate {
    pub email: Option<String>,
    pub status: Option<String>,
    pub ssl_enabled: Option<bool>,
    pub ssl_cert: Option<String>,
    pub ssl_key: Option<String>,
    pub backend_host: Option<String>,
    pub backend_port: Option<i32>,
}

impl VhostFieldUpdate {
    pub fn is_empty(&self) -> bool {
        self.email.is_none()
            && self.status.is_none()
            && self.ssl_enabled.is_none()
            && self.ssl_cert.is_none()
            && self.ssl_key.is_none()
            && self.backend_host.is_none()
            && self.backend_port.is_none()
    }

    /// Names of the columns this update touches, for audit details and
    /// API responses.
    pub fn touched(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.email.is_some() {
            fields.push("email");
        }
        if self.status.is_some() {
            fields.push("status");
        }
        if self.ssl_enabled.is_some() {
            fields.push("ssl_enabled");
        }
        if self.ssl_cert.is_some() {
            fields.push("ssl_cert");
        }
        if self.ssl_key.is_some() {
            fields.push("ssl_key");
        }
        if self.backend_host.is_some() {
            fields.push("backend_host");
        }
        if self.backend_port.is_some() {
            fields.push("backend_port");
        }
        fields
    }
}

// ============================================================
// Managed databases (the `panel_databases` catalog, not the
// panel's own schema)
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ManagedDatabase {
    pub id: i64,
    pub name: String,
    pub username: String,
    pub host: String,
    pub charset: String,
    pub collation: String,
    pub status: String,
    pub created_by: i64,
    pub created_at: DateTime<Utc>,
}

// ============================================================
// PHP extensions
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PhpExtension {
    pub id: i64,
    pub name: String,
    pub display_name: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub installed: bool,
    pub category: String,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================
// Firewall rules
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FirewallRule {
    pub id: i64,
    pub rule_id: String,
    pub action: String,
    pub protocol: String,
    pub port: String,
    pub source: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub created_by: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewFirewallRule {
    pub rule_id: String,
    pub action: String,
    pub protocol: String,
    pub port: String,
    pub source: String,
    pub description: Option<String>,
    pub created_by: i64,
}

// ============================================================
// Audit log rows
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SystemLogEntry {
    pub id: i64,
    pub user_id: Option<i64>,
    pub action: String,
    pub entity: Option<String>,
    pub entity_id: Option<i64>,
    pub details: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for one audit row.
#[derive(Debug, Clone, Default)]
pub struct NewLogEntry {
    pub user_id: Option<i64>,
    pub action: String,
    pub entity: Option<String>,
    pub entity_id: Option<i64>,
    pub details: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub status: String,
}

/// Read-side filter for the audit log. All fields optional; unset
/// fields do not constrain the query.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub user_id: Option<i64>,
    pub action: Option<String>,
    pub status: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

// ============================================================
// Redis desired-state row
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RedisSettingsRow {
    pub id: i64,
    pub maxmemory: String,
    pub maxmemory_policy: String,
    pub timeout: i32,
    pub tcp_keepalive: i32,
    pub password_enabled: bool,
    pub protected_mode: bool,
    pub status: String,
    pub updated_at: DateTime<Utc>,
}

/// Desired Redis settings as submitted by the operator.
#[derive(Debug, Clone)]
pub struct RedisSettingsUpdate {
    pub maxmemory: String,
    pub maxmemory_policy: String,
    pub timeout: i32,
    pub tcp_keepalive: i32,
}

// ============================================================
// Backups
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Backup {
    pub id: i64,
    pub name: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub backup_type: String,
    pub path: String,
    pub size: i64,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_by: i64,
}

#[derive(Debug, Clone)]
pub struct NewBackup {
    pub name: String,
    pub backup_type: String,
    pub path: String,
    pub size: i64,
    pub status: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_by: i64,
}

// ============================================================
// Settings
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SettingRow {
    pub id: i64,
    pub setting_key: String,
    pub setting_value: String,
    pub setting_type: String,
    pub category: String,
    pub description: Option<String>,
    pub updated_at: DateTime<Utc>,
}
