use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, Uri};
use axum::Extension;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use lp_db::models::LogFilter;
use lp_services::RequestIdentity;

use crate::handlers::{parse_body, require_post};
use crate::http::envelope::{ApiError, ApiSuccess};
use crate::http::gateway::{require_admin, MaybeSession};
use crate::http::query;
use crate::state::AppContext;

const DEFAULT_LOG_PAGE: i64 = 100;
const MAX_LOG_PAGE: i64 = 1000;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ControlBody {
    service: String,
    action: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CreateBackupBody {
    #[serde(rename = "type")]
    backup_type: String,
}

/// Host monitoring, managed services, the audit log, and backups.
pub async fn dispatch(
    State(ctx): State<Arc<AppContext>>,
    Extension(identity): Extension<RequestIdentity>,
    Extension(session): Extension<MaybeSession>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Result<ApiSuccess, ApiError> {
    require_admin(&session)?;
    let q = uri.query();
    let action = query::param(q, "action").unwrap_or_default();
    match action.as_str() {
        "dashboard" => {
            let dashboard = ctx.system.dashboard().await?;
            Ok(ApiSuccess::data(dashboard).message("Dashboard data retrieved"))
        }
        "info" => {
            let info = ctx.system.info().await?;
            Ok(ApiSuccess::data(info).message("System information retrieved"))
        }
        "resources" => {
            let stats = ctx.system.resources().await?;
            Ok(ApiSuccess::data(stats).message("Resource usage retrieved"))
        }
        "disk_usage" => {
            let stats = ctx.system.resources().await?;
            Ok(ApiSuccess::data(json!({ "disks": stats.disks })).message("Disk usage retrieved"))
        }
        "network_stats" => {
            let stats = ctx.system.resources().await?;
            Ok(ApiSuccess::data(json!({ "network": stats.network }))
                .message("Network statistics retrieved"))
        }
        "services" => {
            let services = ctx.system.services().await;
            let total = services.len();
            let running = services.iter().filter(|s| s.running).count();
            Ok(ApiSuccess::data(json!({
                "services": services,
                "total": total,
                "running": running,
            }))
            .message("Services status retrieved"))
        }
        "service_status" => {
            let service = query::param(q, "service")
                .ok_or_else(|| ApiError::Validation("Service name is required".to_string()))?;
            let state = ctx.system.service_status(&service).await?;
            Ok(ApiSuccess::data(state).message("Service status retrieved"))
        }
        "control" => {
            require_post(&method)?;
            let req: ControlBody = parse_body(&body)?;
            let state = ctx
                .system
                .control_service(&identity, &req.service, &req.action)
                .await?;
            let message = format!(
                "Service '{}' {} successfully",
                req.service,
                past_tense(&req.action)
            );
            Ok(ApiSuccess::data(state).message(message))
        }
        "processes" => {
            let limit = query::int(q, "limit").unwrap_or(20).clamp(1, 50) as usize;
            let sample = ctx.system.processes(limit).await?;
            Ok(ApiSuccess::data(sample).message("Processes retrieved"))
        }
        "logs" => {
            let filter = log_filter(q);
            let (logs, total) = ctx.audit_log.logs(&filter).await?;
            Ok(ApiSuccess::data(json!({
                "logs": logs,
                "total": total,
                "limit": filter.limit,
                "offset": filter.offset,
            }))
            .message("Logs retrieved"))
        }
        "backups" => {
            let list = ctx.backups.list().await?;
            Ok(ApiSuccess::data(list).message("Backups retrieved successfully"))
        }
        "create_backup" => {
            require_post(&method)?;
            let req: CreateBackupBody = parse_body(&body)?;
            let backup_type = if req.backup_type.is_empty() {
                "full"
            } else {
                req.backup_type.as_str()
            };
            let backup = ctx
                .backups
                .create_archive_backup(&identity, backup_type)
                .await?;
            Ok(ApiSuccess::data(backup).message("Backup created successfully"))
        }
        "delete_backup" => {
            require_post(&method)?;
            let id = query::int(q, "id")
                .ok_or_else(|| ApiError::Validation("Backup ID is required".to_string()))?;
            ctx.backups.delete(&identity, id).await?;
            Ok(ApiSuccess::empty().message("Backup deleted successfully"))
        }
        "backup_stats" => {
            let stats = ctx.backups.statistics().await?;
            Ok(ApiSuccess::data(stats).message("Backup statistics retrieved"))
        }
        _ => Err(ApiError::Validation("Invalid action".to_string())),
    }
}

fn past_tense(action: &str) -> &'static str {
    match action {
        "start" => "started",
        "stop" => "stopped",
        "restart" => "restarted",
        "reload" => "reloaded",
        _ => "controlled",
    }
}

/// Builds the audit-log filter from query parameters. `action_filter`
/// avoids clashing with the dispatch `action` parameter.
fn log_filter(q: Option<&str>) -> LogFilter {
    LogFilter {
        user_id: query::int(q, "user_id"),
        action: query::param(q, "action_filter"),
        status: query::param(q, "status"),
        from: query::param(q, "date_from").as_deref().and_then(parse_log_date),
        to: query::param(q, "date_to").as_deref().and_then(parse_log_date),
        limit: query::int(q, "limit")
            .unwrap_or(DEFAULT_LOG_PAGE)
            .clamp(1, MAX_LOG_PAGE),
        offset: query::int(q, "offset").unwrap_or(0).max(0),
    }
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS`, or a bare date (midnight).
fn parse_log_date(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ndt| ndt.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_date_formats() {
        assert!(parse_log_date("2026-03-01T12:30:00Z").is_some());
        assert!(parse_log_date("2026-03-01 12:30:00").is_some());
        let midnight = parse_log_date("2026-03-01").unwrap();
        assert_eq!(midnight.to_rfc3339(), "2026-03-01T00:00:00+00:00");
        assert!(parse_log_date("yesterday").is_none());
    }

    #[test]
    fn test_log_filter_defaults_and_clamps() {
        let filter = log_filter(None);
        assert_eq!(filter.limit, DEFAULT_LOG_PAGE);
        assert_eq!(filter.offset, 0);
        assert!(filter.action.is_none());

        let filter = log_filter(Some(
            "action=logs&action_filter=login&limit=9999&offset=-3&date_from=2026-01-01",
        ));
        assert_eq!(filter.action.as_deref(), Some("login"));
        assert_eq!(filter.limit, MAX_LOG_PAGE);
        assert_eq!(filter.offset, 0);
        assert!(filter.from.is_some());
    }

    #[test]
    fn test_past_tense() {
        assert_eq!(past_tense("start"), "started");
        assert_eq!(past_tense("stop"), "stopped");
        assert_eq!(past_tense("restart"), "restarted");
    }
}
