//! Audit event persistence and the read side of the activity log.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Serialize;
use sqlx::MySqlPool;
use tracing::error;

use lp_core::security::audit::{AuditEvent, AuditLogger, FileAuditLogger};
use lp_db::models::{LogFilter, NewLogEntry, SystemLogEntry};
use lp_db::queries;
use lp_db::DbError;

fn entry_from_event(event: &AuditEvent) -> NewLogEntry {
    NewLogEntry {
        user_id: event.user_id,
        action: event.action.to_string(),
        entity: Some(event.entity.clone()),
        entity_id: event.entity_id,
        details: event.details.as_ref().map(|d| d.to_string()),
        ip_address: event.ip_address.clone(),
        user_agent: event.user_agent.clone(),
        status: event.result.to_string(),
    }
}

/// Audit logger writing to the `system_logs` table.
///
/// When the insert fails the event still lands in the JSON-lines file
/// log, so a database outage never silently drops an audit trail.
pub struct DbAuditLogger {
    pool: MySqlPool,
    fallback: FileAuditLogger,
}

impl DbAuditLogger {
    pub fn new(pool: MySqlPool, fallback: FileAuditLogger) -> Self {
        Self { pool, fallback }
    }
}

#[async_trait]
impl AuditLogger for DbAuditLogger {
    async fn log_event(&self, event: &AuditEvent) {
        let entry = entry_from_event(event);
        if let Err(e) = queries::insert_system_log(&self.pool, &entry).await {
            error!(error = %e, action = %event.action, "Audit insert failed, writing to file log");
            self.fallback.log_event(event).await;
        }
    }
}

/// Aggregate counts over a recent window of the activity log.
#[derive(Debug, Serialize)]
pub struct AuditStatistics {
    pub days: i64,
    pub by_status: BTreeMap<String, i64>,
    pub top_actions: Vec<ActionCount>,
}

#[derive(Debug, Serialize)]
pub struct ActionCount {
    pub action: String,
    pub count: i64,
}

/// Read access to `system_logs` plus retention cleanup.
pub struct AuditQueryService {
    pool: MySqlPool,
}

impl AuditQueryService {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    /// Filtered page of log entries plus the unpaged total.
    pub async fn logs(
        &self,
        filter: &LogFilter,
    ) -> Result<(Vec<SystemLogEntry>, i64), DbError> {
        let entries = queries::list_system_logs(&self.pool, filter).await?;
        let total = queries::count_system_logs(&self.pool, filter).await?;
        Ok((entries, total))
    }

    pub async fn recent(&self, limit: i64) -> Result<Vec<SystemLogEntry>, DbError> {
        queries::recent_system_logs(&self.pool, limit).await
    }

    pub async fn statistics(&self, days: i64) -> Result<AuditStatistics, DbError> {
        let since = Utc::now() - Duration::days(days);
        let by_status = queries::log_status_counts(&self.pool, since)
            .await?
            .into_iter()
            .collect();
        let top_actions = queries::log_action_counts(&self.pool, since, 10)
            .await?
            .into_iter()
            .map(|(action, count)| ActionCount { action, count })
            .collect();
        Ok(AuditStatistics {
            days,
            by_status,
            top_actions,
        })
    }

    /// Delete entries older than `days`; returns how many went.
    pub async fn cleanup(&self, days: i64) -> Result<u64, DbError> {
        queries::delete_logs_older_than(&self.pool, days).await
    }
}
