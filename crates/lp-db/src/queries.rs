use chrono::{DateTime, Utc};
use sqlx::{MySql, MySqlPool, QueryBuilder};
use tracing::debug;

use crate::models::*;
use crate::pool::{duplicate_as, DbError};

// ============================================================
// Users
// ============================================================

const USER_COLUMNS: &str = "id, username, password_hash, email, role, status, login_attempts, \
                            locked_until, last_login, created_at, updated_at";

/// Look up a user by username or email, the two identifiers accepted at
/// login.
pub async fn get_user_by_identifier(
    pool: &MySqlPool,
    identifier: &str,
) -> Result<Option<User>, DbError> {
    let user = sqlx::query_as::<_, User>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE username = ? OR email = ?"
    ))
    .bind(identifier)
    .bind(identifier)
    .fetch_optional(pool)
    .await?;
    Ok(user)
}

pub async fn get_user_by_id(pool: &MySqlPool, id: i64) -> Result<User, DbError> {
    sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("User with id {}", id)))
}

pub async fn create_panel_user(
    pool: &MySqlPool,
    username: &str,
    password_hash: &str,
    email: &str,
    role: &str,
) -> Result<i64, DbError> {
    let result = sqlx::query(
        "INSERT INTO users (username, password_hash, email, role, status) VALUES (?, ?, ?, ?, 'active')",
    )
    .bind(username)
    .bind(password_hash)
    .bind(email)
    .bind(role)
    .execute(pool)
    .await
    .map_err(|e| duplicate_as(e, "Username or email already exists"))?;

    debug!(username, "Created panel user");
    Ok(result.last_insert_id() as i64)
}

pub async fn set_login_attempts(pool: &MySqlPool, id: i64, attempts: i32) -> Result<(), DbError> {
    sqlx::query("UPDATE users SET login_attempts = ? WHERE id = ?")
        .bind(attempts)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn lock_account(
    pool: &MySqlPool,
    id: i64,
    locked_until: DateTime<Utc>,
) -> Result<(), DbError> {
    sqlx::query("UPDATE users SET status = 'locked', locked_until = ? WHERE id = ?")
        .bind(locked_until)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Reset an expired lockout: active status, zero attempts, no window.
pub async fn unlock_account(pool: &MySqlPool, id: i64) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE users SET status = 'active', login_attempts = 0, locked_until = NULL WHERE id = ?",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn record_login_success(pool: &MySqlPool, id: i64) -> Result<(), DbError> {
    sqlx::query("UPDATE users SET login_attempts = 0, last_login = NOW() WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn update_user_password(
    pool: &MySqlPool,
    id: i64,
    password_hash: &str,
) -> Result<(), DbError> {
    let result = sqlx::query("UPDATE users SET password_hash = ? WHERE id = ?")
        .bind(password_hash)
        .bind(id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound(format!("User with id {}", id)));
    }
    Ok(())
}

// ============================================================
// Sessions
// ============================================================

const SESSION_COLUMNS: &str =
    "token, user_id, csrf_token, ip_address, user_agent, created_at, last_seen, expires_at";

pub async fn create_session(
    pool: &MySqlPool,
    token: &str,
    user_id: i64,
    csrf_token: &str,
    ip_address: Option<&str>,
    user_agent: Option<&str>,
    expires_at: DateTime<Utc>,
) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO sessions (token, user_id, csrf_token, ip_address, user_agent, expires_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(token)
    .bind(user_id)
    .bind(csrf_token)
    .bind(ip_address)
    .bind(user_agent)
    .bind(expires_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Fetch a session only if it has not expired.
pub async fn get_session(pool: &MySqlPool, token: &str) -> Result<Option<SessionRecord>, DbError> {
    let session = sqlx::query_as::<_, SessionRecord>(&format!(
        "SELECT {SESSION_COLUMNS} FROM sessions WHERE token = ? AND expires_at > NOW()"
    ))
    .bind(token)
    .fetch_optional(pool)
    .await?;
    Ok(session)
}

pub async fn touch_session(pool: &MySqlPool, token: &str) -> Result<(), DbError> {
    sqlx::query("UPDATE sessions SET last_seen = NOW() WHERE token = ?")
        .bind(token)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn delete_session(pool: &MySqlPool, token: &str) -> Result<(), DbError> {
    sqlx::query("DELETE FROM sessions WHERE token = ?")
        .bind(token)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn purge_expired_sessions(pool: &MySqlPool) -> Result<u64, DbError> {
    let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= NOW()")
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

// ============================================================
// API keys
// ============================================================

/// Fetch an API key only while it is active and unexpired.
pub async fn find_active_api_key(pool: &MySqlPool, key: &str) -> Result<Option<ApiKey>, DbError> {
    let row = sqlx::query_as::<_, ApiKey>(
        "SELECT id, user_id, api_key, name, status, created_at, expires_at FROM api_keys \
         WHERE api_key = ? AND status = 'active' AND (expires_at IS NULL OR expires_at > NOW())",
    )
    .bind(key)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

// ============================================================
// Virtual hosts
// ============================================================

const VHOST_COLUMNS: &str = "id, domain, docroot, email, type, backend_host, backend_port, \
                             php_version, ssl_enabled, ssl_cert, ssl_key, ssl_issuer, \
                             ssl_auto_renew, status, created_by, created_at, updated_at";

pub async fn insert_vhost(pool: &MySqlPool, vhost: &NewVirtualHost) -> Result<i64, DbError> {
    let result = sqlx::query(
        "INSERT INTO virtual_hosts (domain, docroot, email, type, backend_host, backend_port, php_version, created_by) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&vhost.domain)
    .bind(&vhost.docroot)
    .bind(&vhost.email)
    .bind(&vhost.vhost_type)
    .bind(&vhost.backend_host)
    .bind(vhost.backend_port)
    .bind(&vhost.php_version)
    .bind(vhost.created_by)
    .execute(pool)
    .await
    .map_err(|e| duplicate_as(e, "Domain already exists"))?;

    debug!(domain = %vhost.domain, "Created virtual host row");
    Ok(result.last_insert_id() as i64)
}

pub async fn list_vhosts(pool: &MySqlPool) -> Result<Vec<VirtualHost>, DbError> {
    let vhosts = sqlx::query_as::<_, VirtualHost>(&format!(
        "SELECT {VHOST_COLUMNS} FROM virtual_hosts ORDER BY created_at DESC"
    ))
    .fetch_all(pool)
    .await?;
    Ok(vhosts)
}

pub async fn get_vhost_by_domain(pool: &MySqlPool, domain: &str) -> Result<VirtualHost, DbError> {
    sqlx::query_as::<_, VirtualHost>(&format!(
        "SELECT {VHOST_COLUMNS} FROM virtual_hosts WHERE domain = ?"
    ))
    .bind(domain)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| DbError::NotFound(format!("Virtual host {} not found", domain)))
}

pub async fn get_vhost_by_id(pool: &MySqlPool, id: i64) -> Result<VirtualHost, DbError> {
    sqlx::query_as::<_, VirtualHost>(&format!(
        "SELECT {VHOST_COLUMNS} FROM virtual_hosts WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| DbError::NotFound(format!("Virtual host {} not found", id)))
}

/// Apply a partial update; unset fields leave their columns untouched.
/// The caller is expected to reject an all-`None` update up front.
pub async fn update_vhost_fields(
    pool: &MySqlPool,
    id: i64,
    update: &VhostFieldUpdate,
) -> Result<(), DbError> {
    let mut builder: QueryBuilder<MySql> = QueryBuilder::new("UPDATE virtual_hosts SET ");
    let mut set = builder.separated(", ");
    if let Some(ref email) = update.email {
        set.push("email = ").push_bind_unseparated(email.as_str());
    }
    if let Some(ref status) = update.status {
        set.push("status = ").push_bind_unseparated(status.as_str());
    }
    if let Some(ssl_enabled) = update.ssl_enabled {
        set.push("ssl_enabled = ").push_bind_unseparated(ssl_enabled);
    }
    if let Some(ref ssl_cert) = update.ssl_cert {
        set.push("ssl_cert = ").push_bind_unseparated(ssl_cert.as_str());
    }
    if let Some(ref ssl_key) = update.ssl_key {
        set.push("ssl_key = ").push_bind_unseparated(ssl_key.as_str());
    }
    if let Some(ref backend_host) = update.backend_host {
        set.push("backend_host = ")
            .push_bind_unseparated(backend_host.as_str());
    }
    if let Some(backend_port) = update.backend_port {
        set.push("backend_port = ").push_bind_unseparated(backend_port);
    }
    builder.push(" WHERE id = ").push_bind(id);

    builder.build().execute(pool).await?;
    Ok(())
}

pub async fn vhost_domain_exists(pool: &MySqlPool, domain: &str) -> Result<bool, DbError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM virtual_hosts WHERE domain = ?")
        .bind(domain)
        .fetch_one(pool)
        .await?;
    Ok(count > 0)
}

pub async fn count_vhosts(pool: &MySqlPool) -> Result<i64, DbError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM virtual_hosts")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

pub async fn delete_vhost_by_domain(pool: &MySqlPool, domain: &str) -> Result<(), DbError> {
    let result = sqlx::query("DELETE FROM virtual_hosts WHERE domain = ?")
        .bind(domain)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound(format!("Virtual host {} not found", domain)));
    }

    debug!(domain, "Deleted virtual host row");
    Ok(())
}

/// Record issued certificate material against the vhost.
pub async fn set_vhost_ssl(
    pool: &MySqlPool,
    domain: &str,
    cert_path: &str,
    key_path: &str,
    issuer: &str,
) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE virtual_hosts SET ssl_enabled = 1, ssl_cert = ?, ssl_key = ?, ssl_issuer = ?, \
         ssl_auto_renew = 1 WHERE domain = ?",
    )
    .bind(cert_path)
    .bind(key_path)
    .bind(issuer)
    .bind(domain)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn clear_vhost_ssl(pool: &MySqlPool, domain: &str) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE virtual_hosts SET ssl_enabled = 0, ssl_cert = NULL, ssl_key = NULL, \
         ssl_issuer = NULL, ssl_auto_renew = 0 WHERE domain = ?",
    )
    .bind(domain)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_vhost_auto_renew(
    pool: &MySqlPool,
    domain: &str,
    enabled: bool,
) -> Result<(), DbError> {
    sqlx::query("UPDATE virtual_hosts SET ssl_auto_renew = ? WHERE domain = ?")
        .bind(enabled)
        .bind(domain)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn list_ssl_vhosts(pool: &MySqlPool) -> Result<Vec<VirtualHost>, DbError> {
    let vhosts = sqlx::query_as::<_, VirtualHost>(&format!(
        "SELECT {VHOST_COLUMNS} FROM virtual_hosts WHERE ssl_enabled = 1 ORDER BY domain"
    ))
    .fetch_all(pool)
    .await?;
    Ok(vhosts)
}

/// Domains eligible for the nightly renewal sweep.
pub async fn list_auto_renew_vhosts(pool: &MySqlPool) -> Result<Vec<VirtualHost>, DbError> {
    let vhosts = sqlx::query_as::<_, VirtualHost>(&format!(
        "SELECT {VHOST_COLUMNS} FROM virtual_hosts WHERE ssl_enabled = 1 AND ssl_auto_renew = 1 \
         ORDER BY domain"
    ))
    .fetch_all(pool)
    .await?;
    Ok(vhosts)
}

// ============================================================
// Managed databases (catalog rows)
// ============================================================

const DATABASE_COLUMNS: &str =
    "id, name, username, host, charset, collation, status, created_by, created_at";

pub async fn insert_managed_database(
    pool: &MySqlPool,
    name: &str,
    username: &str,
    host: &str,
    charset: &str,
    collation: &str,
    created_by: i64,
) -> Result<i64, DbError> {
    let result = sqlx::query(
        "INSERT INTO panel_databases (name, username, host, charset, collation, created_by) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(name)
    .bind(username)
    .bind(host)
    .bind(charset)
    .bind(collation)
    .bind(created_by)
    .execute(pool)
    .await
    .map_err(|e| duplicate_as(e, "Database already exists"))?;

    Ok(result.last_insert_id() as i64)
}

pub async fn list_managed_databases(pool: &MySqlPool) -> Result<Vec<ManagedDatabase>, DbError> {
    let dbs = sqlx::query_as::<_, ManagedDatabase>(&format!(
        "SELECT {DATABASE_COLUMNS} FROM panel_databases ORDER BY name"
    ))
    .fetch_all(pool)
    .await?;
    Ok(dbs)
}

pub async fn get_managed_database(
    pool: &MySqlPool,
    name: &str,
) -> Result<Option<ManagedDatabase>, DbError> {
    let db = sqlx::query_as::<_, ManagedDatabase>(&format!(
        "SELECT {DATABASE_COLUMNS} FROM panel_databases WHERE name = ?"
    ))
    .bind(name)
    .fetch_optional(pool)
    .await?;
    Ok(db)
}

pub async fn delete_managed_database(pool: &MySqlPool, name: &str) -> Result<(), DbError> {
    sqlx::query("DELETE FROM panel_databases WHERE name = ?")
        .bind(name)
        .execute(pool)
        .await?;
    Ok(())
}

/// Live schema listing with on-disk size and table count, system
/// schemas excluded. Sizes come from information_schema and lag the
/// storage engine slightly.
pub async fn list_live_databases(pool: &MySqlPool) -> Result<Vec<(String, i64, i64)>, DbError> {
    let rows: Vec<(String, i64, i64)> = sqlx::query_as(
        "SELECT s.schema_name, \
                CAST(COALESCE(SUM(t.data_length + t.index_length), 0) AS SIGNED), \
                COUNT(t.table_name) \
         FROM information_schema.schemata s \
         LEFT JOIN information_schema.tables t ON t.table_schema = s.schema_name \
         WHERE s.schema_name NOT IN ('information_schema', 'performance_schema', 'mysql', 'sys') \
         GROUP BY s.schema_name ORDER BY s.schema_name",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn list_db_users(pool: &MySqlPool) -> Result<Vec<(String, String)>, DbError> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT User, Host FROM mysql.user \
         WHERE User NOT IN ('root', 'mysql.sys', 'mysql.session', 'mysql.infoschema', \
                            'mariadb.sys', 'debian-sys-maint') \
         ORDER BY User",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ------------------------------------------------------------
// DDL for managed databases. Identifiers are allowlist-validated
// upstream ([a-zA-Z0-9_] only), so interpolation cannot escape the
// backticks; the password literal is quoted here.
// ------------------------------------------------------------

pub async fn create_database_ddl(
    pool: &MySqlPool,
    name: &str,
    charset: &str,
    collation: &str,
) -> Result<(), DbError> {
    let sql = format!(
        "CREATE DATABASE IF NOT EXISTS `{name}` CHARACTER SET {charset} COLLATE {collation}"
    );
    sqlx::query(&sql).execute(pool).await?;
    Ok(())
}

pub async fn drop_database_ddl(pool: &MySqlPool, name: &str) -> Result<(), DbError> {
    let sql = format!("DROP DATABASE IF EXISTS `{name}`");
    sqlx::query(&sql).execute(pool).await?;
    Ok(())
}

/// Quote a password for use in `IDENTIFIED BY '...'`. Callers reject
/// backslashes and control characters first; single quotes are doubled
/// here, which MySQL accepts in all sql modes.
pub fn password_literal(password: &str) -> String {
    password.replace('\'', "''")
}

pub async fn create_db_user_ddl(
    pool: &MySqlPool,
    username: &str,
    host: &str,
    password: &str,
) -> Result<(), DbError> {
    let sql = format!(
        "CREATE USER IF NOT EXISTS '{username}'@'{host}' IDENTIFIED BY '{literal}'",
        literal = password_literal(password)
    );
    sqlx::query(&sql).execute(pool).await?;
    Ok(())
}

pub async fn grant_all_on_database_ddl(
    pool: &MySqlPool,
    name: &str,
    username: &str,
    host: &str,
) -> Result<(), DbError> {
    let sql = format!("GRANT ALL PRIVILEGES ON `{name}`.* TO '{username}'@'{host}'");
    sqlx::query(&sql).execute(pool).await?;
    Ok(())
}

pub async fn drop_db_user_ddl(pool: &MySqlPool, username: &str, host: &str) -> Result<(), DbError> {
    let sql = format!("DROP USER IF EXISTS '{username}'@'{host}'");
    sqlx::query(&sql).execute(pool).await?;
    Ok(())
}

pub async fn flush_privileges(pool: &MySqlPool) -> Result<(), DbError> {
    sqlx::query("FLUSH PRIVILEGES").execute(pool).await?;
    Ok(())
}

// ============================================================
// PHP extensions
// ============================================================

const EXTENSION_COLUMNS: &str = "id, name, display_name, description, enabled, installed, \
                                 category, priority, created_at, updated_at";

pub async fn list_extensions(pool: &MySqlPool) -> Result<Vec<PhpExtension>, DbError> {
    let extensions = sqlx::query_as::<_, PhpExtension>(&format!(
        "SELECT {EXTENSION_COLUMNS} FROM php_extensions ORDER BY priority, name"
    ))
    .fetch_all(pool)
    .await?;
    Ok(extensions)
}

pub async fn get_extension(pool: &MySqlPool, name: &str) -> Result<PhpExtension, DbError> {
    sqlx::query_as::<_, PhpExtension>(&format!(
        "SELECT {EXTENSION_COLUMNS} FROM php_extensions WHERE name = ?"
    ))
    .bind(name)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| DbError::NotFound(format!("Extension {} not found", name)))
}

pub async fn set_extension_desired(
    pool: &MySqlPool,
    name: &str,
    enabled: bool,
) -> Result<(), DbError> {
    sqlx::query("UPDATE php_extensions SET enabled = ? WHERE name = ?")
        .bind(enabled)
        .bind(name)
        .execute(pool)
        .await?;
    Ok(())
}

/// Mark an extension installed and enabled after a successful install.
pub async fn mark_extension_installed(pool: &MySqlPool, name: &str) -> Result<(), DbError> {
    sqlx::query("UPDATE php_extensions SET installed = 1, enabled = 1 WHERE name = ?")
        .bind(name)
        .execute(pool)
        .await?;
    Ok(())
}

/// Bulk apply: disable everything, then enable the selected names, in
/// one transaction so readers never see a half-applied selection.
pub async fn apply_extension_selection(
    pool: &MySqlPool,
    enabled_names: &[String],
) -> Result<(), DbError> {
    let mut tx = pool.begin().await?;

    sqlx::query("UPDATE php_extensions SET enabled = 0")
        .execute(&mut *tx)
        .await?;

    for name in enabled_names {
        sqlx::query("UPDATE php_extensions SET enabled = 1 WHERE name = ? AND installed = 1")
            .bind(name)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}

// ============================================================
// Firewall rules
// ============================================================

const RULE_COLUMNS: &str = "id, rule_id, action, protocol, port, source, description, enabled, \
                            created_by, created_at, updated_at";

pub async fn insert_firewall_rule(
    pool: &MySqlPool,
    rule: &NewFirewallRule,
) -> Result<i64, DbError> {
    let result = sqlx::query(
        "INSERT INTO firewall_rules (rule_id, action, protocol, port, source, description, created_by) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&rule.rule_id)
    .bind(&rule.action)
    .bind(&rule.protocol)
    .bind(&rule.port)
    .bind(&rule.source)
    .bind(&rule.description)
    .bind(rule.created_by)
    .execute(pool)
    .await
    .map_err(|e| duplicate_as(e, "Firewall rule already exists"))?;

    debug!(rule_id = %rule.rule_id, "Created firewall rule row");
    Ok(result.last_insert_id() as i64)
}

pub async fn list_firewall_rules(pool: &MySqlPool) -> Result<Vec<FirewallRule>, DbError> {
    let rules = sqlx::query_as::<_, FirewallRule>(&format!(
        "SELECT {RULE_COLUMNS} FROM firewall_rules ORDER BY id DESC"
    ))
    .fetch_all(pool)
    .await?;
    Ok(rules)
}

pub async fn get_firewall_rule(pool: &MySqlPool, rule_id: &str) -> Result<FirewallRule, DbError> {
    sqlx::query_as::<_, FirewallRule>(&format!(
        "SELECT {RULE_COLUMNS} FROM firewall_rules WHERE rule_id = ?"
    ))
    .bind(rule_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| DbError::NotFound(format!("Firewall rule {} not found", rule_id)))
}

pub async fn delete_firewall_rule(pool: &MySqlPool, rule_id: &str) -> Result<(), DbError> {
    let result = sqlx::query("DELETE FROM firewall_rules WHERE rule_id = ?")
        .bind(rule_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound(format!("Firewall rule {} not found", rule_id)));
    }
    Ok(())
}

pub async fn set_firewall_rule_enabled(
    pool: &MySqlPool,
    rule_id: &str,
    enabled: bool,
) -> Result<(), DbError> {
    sqlx::query("UPDATE firewall_rules SET enabled = ? WHERE rule_id = ?")
        .bind(enabled)
        .bind(rule_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn update_firewall_rule_description(
    pool: &MySqlPool,
    rule_id: &str,
    description: Option<&str>,
) -> Result<(), DbError> {
    sqlx::query("UPDATE firewall_rules SET description = ? WHERE rule_id = ?")
        .bind(description)
        .bind(rule_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ============================================================
// Audit log
// ============================================================

const LOG_COLUMNS: &str = "id, user_id, action, entity, entity_id, details, ip_address, \
                           user_agent, status, created_at";

pub async fn insert_system_log(pool: &MySqlPool, entry: &NewLogEntry) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO system_logs (user_id, action, entity, entity_id, details, ip_address, user_agent, status) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(entry.user_id)
    .bind(&entry.action)
    .bind(&entry.entity)
    .bind(entry.entity_id)
    .bind(&entry.details)
    .bind(&entry.ip_address)
    .bind(&entry.user_agent)
    .bind(&entry.status)
    .execute(pool)
    .await?;
    Ok(())
}

fn push_log_filter<'a>(builder: &mut QueryBuilder<'a, MySql>, filter: &'a LogFilter) {
    if let Some(user_id) = filter.user_id {
        builder.push(" AND user_id = ").push_bind(user_id);
    }
    if let Some(ref action) = filter.action {
        builder.push(" AND action = ").push_bind(action.as_str());
    }
    if let Some(ref status) = filter.status {
        builder.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(from) = filter.from {
        builder.push(" AND created_at >= ").push_bind(from);
    }
    if let Some(to) = filter.to {
        builder.push(" AND created_at <= ").push_bind(to);
    }
}

pub async fn list_system_logs(
    pool: &MySqlPool,
    filter: &LogFilter,
) -> Result<Vec<SystemLogEntry>, DbError> {
    let mut builder: QueryBuilder<MySql> = QueryBuilder::new(format!(
        "SELECT {LOG_COLUMNS} FROM system_logs WHERE 1 = 1"
    ));
    push_log_filter(&mut builder, filter);
    builder.push(" ORDER BY created_at DESC, id DESC LIMIT ");
    builder.push_bind(filter.limit);
    builder.push(" OFFSET ");
    builder.push_bind(filter.offset);

    let entries = builder
        .build_query_as::<SystemLogEntry>()
        .fetch_all(pool)
        .await?;
    Ok(entries)
}

pub async fn count_system_logs(pool: &MySqlPool, filter: &LogFilter) -> Result<i64, DbError> {
    let mut builder: QueryBuilder<MySql> =
        QueryBuilder::new("SELECT COUNT(*) FROM system_logs WHERE 1 = 1");
    push_log_filter(&mut builder, filter);

    let count: i64 = builder.build_query_scalar().fetch_one(pool).await?;
    Ok(count)
}

pub async fn recent_system_logs(
    pool: &MySqlPool,
    limit: i64,
) -> Result<Vec<SystemLogEntry>, DbError> {
    let entries = sqlx::query_as::<_, SystemLogEntry>(&format!(
        "SELECT {LOG_COLUMNS} FROM system_logs ORDER BY created_at DESC, id DESC LIMIT ?"
    ))
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(entries)
}

pub async fn log_status_counts(
    pool: &MySqlPool,
    since: DateTime<Utc>,
) -> Result<Vec<(String, i64)>, DbError> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status, COUNT(*) FROM system_logs WHERE created_at >= ? GROUP BY status",
    )
    .bind(since)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn log_action_counts(
    pool: &MySqlPool,
    since: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<(String, i64)>, DbError> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT action, COUNT(*) AS n FROM system_logs WHERE created_at >= ? \
         GROUP BY action ORDER BY n DESC LIMIT ?",
    )
    .bind(since)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn delete_logs_older_than(pool: &MySqlPool, days: i64) -> Result<u64, DbError> {
    let result = sqlx::query("DELETE FROM system_logs WHERE created_at < NOW() - INTERVAL ? DAY")
        .bind(days)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

// ============================================================
// Settings
// ============================================================

pub async fn get_setting(pool: &MySqlPool, key: &str) -> Result<Option<String>, DbError> {
    let value: Option<String> =
        sqlx::query_scalar("SELECT setting_value FROM system_settings WHERE setting_key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await?;
    Ok(value)
}

pub async fn upsert_setting(pool: &MySqlPool, key: &str, value: &str) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO system_settings (setting_key, setting_value) VALUES (?, ?) \
         ON DUPLICATE KEY UPDATE setting_value = VALUES(setting_value)",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_settings(pool: &MySqlPool) -> Result<Vec<SettingRow>, DbError> {
    let settings = sqlx::query_as::<_, SettingRow>(
        "SELECT id, setting_key, setting_value, setting_type, category, description, updated_at \
         FROM system_settings ORDER BY category, setting_key",
    )
    .fetch_all(pool)
    .await?;
    Ok(settings)
}

// ============================================================
// Redis desired state
// ============================================================

const REDIS_COLUMNS: &str = "id, maxmemory, maxmemory_policy, timeout, tcp_keepalive, \
                             password_enabled, protected_mode, status, updated_at";

/// Latest row wins; the table is effectively single-row.
pub async fn get_redis_settings(pool: &MySqlPool) -> Result<Option<RedisSettingsRow>, DbError> {
    let row = sqlx::query_as::<_, RedisSettingsRow>(&format!(
        "SELECT {REDIS_COLUMNS} FROM redis_config ORDER BY id DESC LIMIT 1"
    ))
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn save_redis_settings(
    pool: &MySqlPool,
    update: &RedisSettingsUpdate,
) -> Result<(), DbError> {
    let result = sqlx::query(
        "UPDATE redis_config SET maxmemory = ?, maxmemory_policy = ?, timeout = ?, tcp_keepalive = ? \
         ORDER BY id DESC LIMIT 1",
    )
    .bind(&update.maxmemory)
    .bind(&update.maxmemory_policy)
    .bind(update.timeout)
    .bind(update.tcp_keepalive)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        sqlx::query(
            "INSERT INTO redis_config (maxmemory, maxmemory_policy, timeout, tcp_keepalive) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(&update.maxmemory)
        .bind(&update.maxmemory_policy)
        .bind(update.timeout)
        .bind(update.tcp_keepalive)
        .execute(pool)
        .await?;
    }
    Ok(())
}

pub async fn set_redis_status(pool: &MySqlPool, status: &str) -> Result<(), DbError> {
    sqlx::query("UPDATE redis_config SET status = ? ORDER BY id DESC LIMIT 1")
        .bind(status)
        .execute(pool)
        .await?;
    Ok(())
}

// ============================================================
// Backups
// ============================================================

const BACKUP_COLUMNS: &str =
    "id, name, type, path, size, status, created_at, expires_at, created_by";

pub async fn insert_backup(pool: &MySqlPool, backup: &NewBackup) -> Result<i64, DbError> {
    let result = sqlx::query(
        "INSERT INTO backups (name, type, path, size, status, expires_at, created_by) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&backup.name)
    .bind(&backup.backup_type)
    .bind(&backup.path)
    .bind(backup.size)
    .bind(&backup.status)
    .bind(backup.expires_at)
    .bind(backup.created_by)
    .execute(pool)
    .await?;
    Ok(result.last_insert_id() as i64)
}

pub async fn list_backups(pool: &MySqlPool) -> Result<Vec<Backup>, DbError> {
    let backups = sqlx::query_as::<_, Backup>(&format!(
        "SELECT {BACKUP_COLUMNS} FROM backups ORDER BY created_at DESC"
    ))
    .fetch_all(pool)
    .await?;
    Ok(backups)
}

pub async fn get_backup(pool: &MySqlPool, id: i64) -> Result<Backup, DbError> {
    sqlx::query_as::<_, Backup>(&format!("SELECT {BACKUP_COLUMNS} FROM backups WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("Backup with id {}", id)))
}

pub async fn delete_backup_row(pool: &MySqlPool, id: i64) -> Result<(), DbError> {
    let result = sqlx::query("DELETE FROM backups WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound(format!("Backup with id {}", id)));
    }
    Ok(())
}

pub async fn list_expired_backups(pool: &MySqlPool) -> Result<Vec<Backup>, DbError> {
    let backups = sqlx::query_as::<_, Backup>(&format!(
        "SELECT {BACKUP_COLUMNS} FROM backups WHERE expires_at IS NOT NULL AND expires_at <= NOW()"
    ))
    .fetch_all(pool)
    .await?;
    Ok(backups)
}

/// Per-type (count, total bytes) for completed backups.
pub async fn backup_statistics(pool: &MySqlPool) -> Result<Vec<(String, i64, i64)>, DbError> {
    let rows: Vec<(String, i64, i64)> = sqlx::query_as(
        "SELECT type, COUNT(*), CAST(COALESCE(SUM(size), 0) AS SIGNED) \
         FROM backups WHERE status = 'completed' GROUP BY type",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_literal_doubles_quotes() {
        assert_eq!(password_literal("plain"), "plain");
        assert_eq!(password_literal("o'brien"), "o''brien");
        assert_eq!(password_literal("''"), "''''");
    }
}
