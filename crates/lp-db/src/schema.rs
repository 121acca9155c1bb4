//! Schema bootstrap: CREATE TABLE IF NOT EXISTS at startup, then
//! idempotent seeding so a fresh install is immediately usable.

use sqlx::MySqlPool;
use tracing::{info, warn};

use crate::pool::DbError;

const CREATE_USERS: &str = r#"
CREATE TABLE IF NOT EXISTS `users` (
    `id` BIGINT NOT NULL AUTO_INCREMENT,
    `username` VARCHAR(50) NOT NULL UNIQUE,
    `password_hash` VARCHAR(255) NOT NULL,
    `email` VARCHAR(100) NOT NULL UNIQUE,
    `role` ENUM('admin', 'user') DEFAULT 'admin',
    `status` ENUM('active', 'suspended', 'locked') DEFAULT 'active',
    `login_attempts` INT DEFAULT 0,
    `locked_until` TIMESTAMP NULL,
    `last_login` TIMESTAMP NULL,
    `created_at` TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    `updated_at` TIMESTAMP DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP,
    PRIMARY KEY (`id`),
    INDEX `idx_username` (`username`),
    INDEX `idx_email` (`email`)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci
"#;

const CREATE_SESSIONS: &str = r#"
CREATE TABLE IF NOT EXISTS `sessions` (
    `token` VARCHAR(64) NOT NULL,
    `user_id` BIGINT NOT NULL,
    `csrf_token` VARCHAR(64) NOT NULL,
    `ip_address` VARCHAR(45) NULL,
    `user_agent` VARCHAR(255) NULL,
    `created_at` TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    `last_seen` TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    `expires_at` TIMESTAMP NOT NULL,
    PRIMARY KEY (`token`),
    INDEX `idx_user_id` (`user_id`),
    INDEX `idx_expires_at` (`expires_at`),
    FOREIGN KEY (`user_id`) REFERENCES `users`(`id`) ON DELETE CASCADE
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci
"#;

const CREATE_API_KEYS: &str = r#"
CREATE TABLE IF NOT EXISTS `api_keys` (
    `id` BIGINT NOT NULL AUTO_INCREMENT,
    `user_id` BIGINT NOT NULL,
    `api_key` VARCHAR(64) NOT NULL UNIQUE,
    `name` VARCHAR(100) NULL,
    `status` ENUM('active', 'revoked') DEFAULT 'active',
    `created_at` TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    `expires_at` TIMESTAMP NULL,
    PRIMARY KEY (`id`),
    INDEX `idx_api_key` (`api_key`),
    FOREIGN KEY (`user_id`) REFERENCES `users`(`id`) ON DELETE CASCADE
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci
"#;

const CREATE_VIRTUAL_HOSTS: &str = r#"
CREATE TABLE IF NOT EXISTS `virtual_hosts` (
    `id` BIGINT NOT NULL AUTO_INCREMENT,
    `domain` VARCHAR(255) NOT NULL UNIQUE,
    `docroot` VARCHAR(500) NOT NULL,
    `email` VARCHAR(100) NOT NULL,
    `type` ENUM('wordpress', 'custom', 'proxy') DEFAULT 'custom',
    `backend_host` VARCHAR(255) NULL,
    `backend_port` INT NULL,
    `php_version` VARCHAR(10) DEFAULT '83',
    `ssl_enabled` TINYINT(1) DEFAULT 0,
    `ssl_cert` TEXT NULL,
    `ssl_key` TEXT NULL,
    `ssl_issuer` VARCHAR(100) NULL,
    `ssl_auto_renew` TINYINT(1) DEFAULT 0,
    `status` ENUM('active', 'suspended', 'pending') DEFAULT 'active',
    `created_by` BIGINT NOT NULL,
    `created_at` TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    `updated_at` TIMESTAMP DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP,
    PRIMARY KEY (`id`),
    INDEX `idx_domain` (`domain`),
    INDEX `idx_status` (`status`),
    INDEX `idx_type` (`type`),
    FOREIGN KEY (`created_by`) REFERENCES `users`(`id`) ON DELETE CASCADE
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci
"#;

const CREATE_PANEL_DATABASES: &str = r#"
CREATE TABLE IF NOT EXISTS `panel_databases` (
    `id` BIGINT NOT NULL AUTO_INCREMENT,
    `name` VARCHAR(100) NOT NULL UNIQUE,
    `username` VARCHAR(50) NOT NULL,
    `host` VARCHAR(100) DEFAULT 'localhost',
    `charset` VARCHAR(20) DEFAULT 'utf8mb4',
    `collation` VARCHAR(50) DEFAULT 'utf8mb4_unicode_ci',
    `status` ENUM('active', 'suspended') DEFAULT 'active',
    `created_by` BIGINT NOT NULL,
    `created_at` TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (`id`),
    INDEX `idx_name` (`name`),
    FOREIGN KEY (`created_by`) REFERENCES `users`(`id`) ON DELETE CASCADE
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci
"#;

const CREATE_PHP_EXTENSIONS: &str = r#"
CREATE TABLE IF NOT EXISTS `php_extensions` (
    `id` BIGINT NOT NULL AUTO_INCREMENT,
    `name` VARCHAR(50) NOT NULL UNIQUE,
    `display_name` VARCHAR(100) NOT NULL,
    `description` TEXT NULL,
    `enabled` TINYINT(1) DEFAULT 0,
    `installed` TINYINT(1) DEFAULT 0,
    `category` VARCHAR(50) DEFAULT 'general',
    `priority` INT DEFAULT 0,
    `created_at` TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    `updated_at` TIMESTAMP DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP,
    PRIMARY KEY (`id`),
    INDEX `idx_enabled` (`enabled`),
    INDEX `idx_category` (`category`)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci
"#;

const CREATE_FIREWALL_RULES: &str = r#"
CREATE TABLE IF NOT EXISTS `firewall_rules` (
    `id` BIGINT NOT NULL AUTO_INCREMENT,
    `rule_id` VARCHAR(50) NOT NULL UNIQUE,
    `action` ENUM('allow', 'deny', 'limit') NOT NULL,
    `protocol` ENUM('tcp', 'udp', 'both') DEFAULT 'tcp',
    `port` VARCHAR(100) NOT NULL,
    `source` VARCHAR(100) DEFAULT 'any',
    `description` TEXT NULL,
    `enabled` TINYINT(1) DEFAULT 1,
    `created_by` BIGINT NOT NULL,
    `created_at` TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    `updated_at` TIMESTAMP DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP,
    PRIMARY KEY (`id`),
    INDEX `idx_enabled` (`enabled`),
    INDEX `idx_action` (`action`),
    FOREIGN KEY (`created_by`) REFERENCES `users`(`id`) ON DELETE CASCADE
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci
"#;

const CREATE_SYSTEM_LOGS: &str = r#"
CREATE TABLE IF NOT EXISTS `system_logs` (
    `id` BIGINT NOT NULL AUTO_INCREMENT,
    `user_id` BIGINT NULL,
    `action` VARCHAR(100) NOT NULL,
    `entity` VARCHAR(50) NULL,
    `entity_id` BIGINT NULL,
    `details` TEXT NULL,
    `ip_address` VARCHAR(45) NULL,
    `user_agent` VARCHAR(255) NULL,
    `status` ENUM('success', 'failed', 'warning') DEFAULT 'success',
    `created_at` TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (`id`),
    INDEX `idx_user_id` (`user_id`),
    INDEX `idx_action` (`action`),
    INDEX `idx_status` (`status`),
    INDEX `idx_created_at` (`created_at`),
    FOREIGN KEY (`user_id`) REFERENCES `users`(`id`) ON DELETE SET NULL
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci
"#;

const CREATE_SYSTEM_SETTINGS: &str = r#"
CREATE TABLE IF NOT EXISTS `system_settings` (
    `id` BIGINT NOT NULL AUTO_INCREMENT,
    `setting_key` VARCHAR(100) NOT NULL UNIQUE,
    `setting_value` TEXT NOT NULL,
    `setting_type` ENUM('text', 'number', 'boolean', 'json') DEFAULT 'text',
    `category` VARCHAR(50) DEFAULT 'general',
    `description` TEXT NULL,
    `updated_at` TIMESTAMP DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP,
    PRIMARY KEY (`id`),
    INDEX `idx_category` (`category`)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci
"#;

const CREATE_BACKUPS: &str = r#"
CREATE TABLE IF NOT EXISTS `backups` (
    `id` BIGINT NOT NULL AUTO_INCREMENT,
    `name` VARCHAR(255) NOT NULL,
    `type` ENUM('full', 'database', 'files', 'config') NOT NULL,
    `path` VARCHAR(500) NOT NULL,
    `size` BIGINT DEFAULT 0,
    `status` ENUM('completed', 'failed', 'in_progress', 'scheduled') DEFAULT 'completed',
    `created_at` TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    `expires_at` TIMESTAMP NULL,
    `created_by` BIGINT NOT NULL,
    PRIMARY KEY (`id`),
    INDEX `idx_type` (`type`),
    INDEX `idx_status` (`status`),
    INDEX `idx_created_at` (`created_at`),
    FOREIGN KEY (`created_by`) REFERENCES `users`(`id`) ON DELETE CASCADE
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci
"#;

const CREATE_REDIS_CONFIG: &str = r#"
CREATE TABLE IF NOT EXISTS `redis_config` (
    `id` BIGINT NOT NULL AUTO_INCREMENT,
    `maxmemory` VARCHAR(20) DEFAULT '2g',
    `maxmemory_policy` VARCHAR(50) DEFAULT 'allkeys-lru',
    `timeout` INT DEFAULT 300,
    `tcp_keepalive` INT DEFAULT 60,
    `password_enabled` TINYINT(1) DEFAULT 1,
    `protected_mode` TINYINT(1) DEFAULT 1,
    `status` ENUM('running', 'stopped', 'error') DEFAULT 'running',
    `updated_at` TIMESTAMP DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP,
    PRIMARY KEY (`id`)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci
"#;

/// Fixed extension catalog: (name, display name, description). Seeded
/// once; rows are never removed, only toggled.
pub(crate) const EXTENSION_CATALOG: &[(&str, &str, &str)] = &[
    ("imagick", "Image Processing", "Image manipulation library"),
    ("intl", "Internationalization", "Unicode and internationalization support"),
    ("ioncube", "IonCube Loader", "PHP encoder/decoder"),
    ("redis", "Redis", "Redis caching client"),
    ("mysqli", "MySQLi", "MySQL improved extension"),
    ("pdo", "PDO", "PHP Data Objects"),
    ("pdo_mysql", "PDO MySQL", "MySQL driver for PDO"),
    ("zip", "Zip", "Zip file compression"),
    ("gd", "GD", "Image manipulation"),
    ("curl", "cURL", "URL transfer library"),
    ("mbstring", "Multibyte String", "Multibyte character support"),
    ("xml", "XML", "XML parsing"),
    ("json", "JSON", "JavaScript Object Notation"),
    ("opcache", "OPcache", "PHP opcode caching"),
    ("apcu", "APCu", "User cache for APC"),
    ("memcached", "Memcached", "Memcached client"),
    ("imap", "IMAP", "Email handling"),
    ("exif", "EXIF", "Image metadata"),
    ("fileinfo", "Fileinfo", "File type detection"),
    ("soap", "SOAP", "SOAP protocol"),
    ("xsl", "XSL", "XSLT transformations"),
    ("bz2", "Bzip2", "Bzip2 compression"),
    ("zlib", "Zlib", "Gzip compression"),
];

pub(crate) const DEFAULT_ENABLED_EXTENSIONS: &[&str] = &[
    "mysqli", "pdo", "pdo_mysql", "zip", "gd", "curl", "mbstring", "json", "xml", "opcache",
];

const DEFAULT_SETTINGS: &[(&str, &str, &str, &str, &str)] = &[
    ("panel_title", "LitePanel", "text", "general", "Panel title"),
    ("panel_language", "en", "text", "general", "Panel language"),
    ("panel_theme", "dark", "text", "general", "Panel theme"),
    ("timezone", "UTC", "text", "general", "Server timezone"),
    ("backup_retention", "30", "number", "backup", "Backup retention in days"),
    ("session_lifetime", "7200", "number", "security", "Session lifetime in seconds"),
    ("max_login_attempts", "5", "number", "security", "Maximum login attempts"),
    ("lockout_duration", "900", "number", "security", "Lockout duration in seconds"),
    ("enable_monitoring", "1", "boolean", "monitoring", "Enable system monitoring"),
    ("monitoring_interval", "60", "number", "monitoring", "Monitoring interval in seconds"),
    ("log_retention_days", "30", "number", "logging", "Log retention in days"),
];

/// Seed firewall rows mirroring the rules the installer applies to UFW:
/// (name, action, protocol, port, source, description).
const DEFAULT_FIREWALL_RULES: &[(&str, &str, &str, &str, &str, &str)] = &[
    ("SSH", "allow", "tcp", "22", "any", "SSH access"),
    ("HTTP", "allow", "tcp", "80", "any", "HTTP web server"),
    ("HTTPS", "allow", "tcp", "443", "any", "HTTPS web server"),
    ("OLS-ADMIN", "allow", "tcp", "7080", "any", "OpenLiteSpeed WebAdmin"),
];

/// Create all tables and seed defaults. Safe to run on every startup.
pub async fn initialize(
    pool: &MySqlPool,
    admin_password_hash: &str,
    admin_email: &str,
) -> Result<(), DbError> {
    create_tables(pool).await?;
    seed_defaults(pool, admin_password_hash, admin_email).await?;
    info!("Database schema ready");
    Ok(())
}

async fn create_tables(pool: &MySqlPool) -> Result<(), DbError> {
    let statements = [
        CREATE_USERS,
        CREATE_SESSIONS,
        CREATE_API_KEYS,
        CREATE_VIRTUAL_HOSTS,
        CREATE_PANEL_DATABASES,
        CREATE_PHP_EXTENSIONS,
        CREATE_FIREWALL_RULES,
        CREATE_SYSTEM_LOGS,
        CREATE_SYSTEM_SETTINGS,
        CREATE_BACKUPS,
        CREATE_REDIS_CONFIG,
    ];

    for sql in statements {
        sqlx::query(sql)
            .execute(pool)
            .await
            .map_err(|e| DbError::Schema(format!("create table failed: {}", e)))?;
    }
    Ok(())
}

async fn seed_defaults(
    pool: &MySqlPool,
    admin_password_hash: &str,
    admin_email: &str,
) -> Result<(), DbError> {
    // Default admin login; operators are warned at startup until the
    // password is changed.
    let inserted = sqlx::query(
        "INSERT IGNORE INTO users (username, password_hash, email, role) VALUES ('admin', ?, ?, 'admin')",
    )
    .bind(admin_password_hash)
    .bind(admin_email)
    .execute(pool)
    .await?
    .rows_affected();
    if inserted > 0 {
        warn!("Seeded default admin account; change its password immediately");
    }

    for (priority, (name, display_name, description)) in EXTENSION_CATALOG.iter().enumerate() {
        let on = DEFAULT_ENABLED_EXTENSIONS.contains(name);
        sqlx::query(
            "INSERT IGNORE INTO php_extensions (name, display_name, description, enabled, installed, priority) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(name)
        .bind(display_name)
        .bind(description)
        .bind(on)
        .bind(on)
        .bind(priority as i64)
        .execute(pool)
        .await?;
    }

    for (key, value, value_type, category, description) in DEFAULT_SETTINGS {
        sqlx::query(
            "INSERT IGNORE INTO system_settings (setting_key, setting_value, setting_type, category, description) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(key)
        .bind(value)
        .bind(value_type)
        .bind(category)
        .bind(description)
        .execute(pool)
        .await?;
    }

    // Rule ids embed a timestamp, so INSERT IGNORE cannot dedupe them;
    // seed only into an empty table.
    let rule_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM firewall_rules")
        .fetch_one(pool)
        .await?;
    if rule_count == 0 {
        let epoch = chrono::Utc::now().timestamp();
        for (name, action, protocol, port, source, description) in DEFAULT_FIREWALL_RULES {
            let rule_id = format!("RULE_{}_{}", name, epoch);
            sqlx::query(
                "INSERT INTO firewall_rules (rule_id, action, protocol, port, source, description, created_by) \
                 VALUES (?, ?, ?, ?, ?, ?, 1)",
            )
            .bind(rule_id)
            .bind(action)
            .bind(protocol)
            .bind(port)
            .bind(source)
            .bind(description)
            .execute(pool)
            .await?;
        }
    }

    let redis_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM redis_config")
        .fetch_one(pool)
        .await?;
    if redis_count == 0 {
        sqlx::query(
            "INSERT INTO redis_config (maxmemory, maxmemory_policy, timeout, tcp_keepalive) \
             VALUES ('2g', 'allkeys-lru', 300, 60)",
        )
        .execute(pool)
        .await?;
    }

    Ok(())
}
