//! Shared application state wired once at startup.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::MySqlPool;

use lp_core::config::PanelConfig;
use lp_core::process::{ProcessRunner, SystemRunner};
use lp_core::security::audit::{AuditLogger, FileAuditLogger, NullAuditLogger};
use lp_db::DbCredentials;
use lp_services::audit::{AuditQueryService, DbAuditLogger};
use lp_services::auth::AuthService;
use lp_services::backup::BackupService;
use lp_services::database::{database_name_from_url, DatabaseService};
use lp_services::firewall::FirewallService;
use lp_services::phpext::ExtensionService;
use lp_services::ratelimit::{CounterStore, FileCounterStore, RedisCliStore};
use lp_services::redis::RedisService;
use lp_services::settings::SettingsService;
use lp_services::ssl::SslService;
use lp_services::system::SystemService;
use lp_services::vhost::VhostService;
use lp_services::{LockRegistry, RateLimiter};

/// Everything the HTTP layer needs, built once in `server::run` and
/// handed to axum as `Arc<AppContext>`.
pub struct AppContext {
    pub config: PanelConfig,
    pub pool: MySqlPool,
    pub locks: Arc<LockRegistry>,
    pub limiter: RateLimiter,
    pub audit: Arc<dyn AuditLogger>,
    pub auth: AuthService,
    pub vhosts: VhostService,
    pub ssl: SslService,
    pub databases: DatabaseService,
    pub extensions: ExtensionService,
    pub firewall: FirewallService,
    pub redis: RedisService,
    pub backups: BackupService,
    pub system: SystemService,
    pub settings: SettingsService,
    pub audit_log: AuditQueryService,
}

impl AppContext {
    /// Wire every service against one pool, one runner, one audit sink
    /// and one lock registry.
    pub fn build(config: PanelConfig, pool: MySqlPool, listen: SocketAddr) -> Result<Arc<Self>> {
        let fallback_log = FileAuditLogger::new(&config.audit_log_path())
            .context("Failed to open the audit fallback log")?;
        let audit: Arc<dyn AuditLogger> = Arc::new(DbAuditLogger::new(pool.clone(), fallback_log));
        let runner: Arc<dyn ProcessRunner> = Arc::new(SystemRunner::new(audit.clone()));
        let locks = Arc::new(LockRegistry::new());

        // Rate-limit counters churn on every request; those redis-cli
        // invocations stay out of the audit trail.
        let counter_runner: Arc<dyn ProcessRunner> =
            Arc::new(SystemRunner::new(Arc::new(NullAuditLogger)));
        let counters: Arc<dyn CounterStore> = Arc::new(RedisCliStore::new(
            counter_runner,
            config.redis.host.clone(),
            config.redis.port,
        ));
        let counter_files = FileCounterStore::new(config.rate_limit_dir())
            .context("Failed to create the rate-limit counter directory")?;
        let limiter = RateLimiter::new(config.rate_limit.clone(), Some(counters), counter_files);

        let credentials = DbCredentials::from_url(&config.database_url)
            .context("Failed to parse database credentials from the database URL")?;
        let panel_database =
            database_name_from_url(&config.database_url).unwrap_or_else(|| "litepanel".to_string());

        let auth = AuthService::new(pool.clone(), config.sessions.clone(), audit.clone());
        let vhosts = VhostService::new(
            pool.clone(),
            config.openlitespeed.clone(),
            config.php.clone(),
            runner.clone(),
            locks.clone(),
            audit.clone(),
        );
        let ssl = SslService::new(
            pool.clone(),
            config.openlitespeed.clone(),
            runner.clone(),
            locks.clone(),
            audit.clone(),
        );
        let databases = DatabaseService::new(
            pool.clone(),
            credentials.clone(),
            panel_database,
            runner.clone(),
            locks.clone(),
            audit.clone(),
        );
        let extensions = ExtensionService::new(
            pool.clone(),
            config.openlitespeed.clone(),
            config.php.clone(),
            runner.clone(),
            locks.clone(),
            audit.clone(),
        );
        let firewall = FirewallService::new(
            pool.clone(),
            runner.clone(),
            locks.clone(),
            audit.clone(),
            listen.port(),
        );
        let redis = RedisService::new(
            pool.clone(),
            config.redis.clone(),
            runner.clone(),
            locks.clone(),
            audit.clone(),
        );
        let backups = BackupService::new(
            pool.clone(),
            config.backups.clone(),
            config.openlitespeed.clone(),
            credentials,
            runner.clone(),
            locks.clone(),
            audit.clone(),
        );
        let system = SystemService::new(
            pool.clone(),
            config.openlitespeed.clone(),
            runner,
            audit.clone(),
        );
        let settings = SettingsService::new(pool.clone(), audit.clone());
        let audit_log = AuditQueryService::new(pool.clone());

        Ok(Arc::new(Self {
            config,
            pool,
            locks,
            limiter,
            audit,
            auth,
            vhosts,
            ssl,
            databases,
            extensions,
            firewall,
            redis,
            backups,
            system,
            settings,
            audit_log,
        }))
    }
}
