//! Periodic housekeeping: session purge, rate-limit counter sweep,
//! lock registry pruning, retention cleanup, and the certificate
//! renewal sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use lp_db::queries;

use crate::state::AppContext;

/// Cadence of the cheap in-process sweeps.
const FAST_INTERVAL: Duration = Duration::from_secs(300);
/// Retention and certificate work runs once per this many fast ticks
/// (24 hours at the five-minute cadence).
const DAILY_TICKS: u32 = 288;

const DEFAULT_LOG_RETENTION_DAYS: i64 = 30;

/// Starts the maintenance loop on its own task. The loop never exits;
/// it dies with the process on shutdown.
pub fn spawn(ctx: Arc<AppContext>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(FAST_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks: u32 = 0;
        loop {
            interval.tick().await;
            fast_cycle(&ctx).await;
            ticks += 1;
            if ticks >= DAILY_TICKS {
                ticks = 0;
                daily_cycle(&ctx).await;
            }
        }
    });
    info!("Maintenance loop started");
}

async fn fast_cycle(ctx: &AppContext) {
    match ctx.auth.purge_expired_sessions().await {
        Ok(0) => {}
        Ok(purged) => debug!(purged, "Dropped expired sessions"),
        Err(e) => warn!(error = %e, "Session purge failed"),
    }

    let swept = ctx.limiter.sweep().await;
    if swept > 0 {
        debug!(swept, "Removed expired rate-limit counters");
    }

    let released = ctx.locks.purge_unused().await;
    if released > 0 {
        debug!(released, "Pruned idle resource locks");
    }
}

async fn daily_cycle(ctx: &AppContext) {
    match ctx.backups.cleanup_expired().await {
        Ok(0) => {}
        Ok(removed) => info!(removed, "Removed expired backups"),
        Err(e) => warn!(error = %e, "Backup retention cleanup failed"),
    }

    let days = log_retention_days(ctx).await;
    match ctx.audit_log.cleanup(days).await {
        Ok(0) => {}
        Ok(removed) => info!(removed, days, "Trimmed old audit log entries"),
        Err(e) => warn!(error = %e, "Audit log cleanup failed"),
    }

    match ctx.ssl.renew_due().await {
        Ok(sweep) if sweep.checked > 0 => info!(
            checked = sweep.checked,
            renewed = sweep.renewed.len(),
            failed = sweep.failed.len(),
            "Certificate renewal sweep finished"
        ),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Certificate renewal sweep failed"),
    }
}

/// Retention window for `system_logs`, tunable through the settings
/// table.
async fn log_retention_days(ctx: &AppContext) -> i64 {
    match queries::get_setting(&ctx.pool, "log_retention_days").await {
        Ok(Some(value)) => value.parse().unwrap_or(DEFAULT_LOG_RETENTION_DAYS),
        _ => DEFAULT_LOG_RETENTION_DAYS,
    }
}
