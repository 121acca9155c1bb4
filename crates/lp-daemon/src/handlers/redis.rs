use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, Uri};
use axum::Extension;

use lp_services::redis::UpdateRedisConfigRequest;
use lp_services::RequestIdentity;

use crate::handlers::{parse_body, require_post};
use crate::http::envelope::{ApiError, ApiSuccess};
use crate::http::gateway::{require_admin, MaybeSession};
use crate::http::query;
use crate::state::AppContext;

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
        "status" => {
            let status = ctx.redis.status().await?;
            Ok(ApiSuccess::data(status).message("Redis status retrieved"))
        }
        "info" => {
            let info = ctx.redis.info().await?;
            Ok(ApiSuccess::data(info).message("Redis information retrieved"))
        }
        "get_stats" => {
            let stats = ctx.redis.stats().await?;
            Ok(ApiSuccess::data(stats).message("Redis statistics retrieved"))
        }
        "config" => {
            let view = ctx.redis.get_config().await?;
            Ok(ApiSuccess::data(view).message("Redis configuration retrieved"))
        }
        "update_config" => {
            require_post(&method)?;
            let req: UpdateRedisConfigRequest = parse_body(&body)?;
            let outcome = ctx.redis.update_config(&identity, &req).await?;
            Ok(ApiSuccess::data(outcome).message("Redis configuration updated successfully"))
        }
        "start" | "stop" | "restart" => {
            require_post(&method)?;
            let status = ctx.redis.control(&identity, &action).await?;
            let message = match action.as_str() {
                "start" => "Redis started successfully",
                "stop" => "Redis stopped successfully",
                _ => "Redis restarted successfully",
            };
            Ok(ApiSuccess::data(status).message(message))
        }
        "flush" => {
            require_post(&method)?;
            let outcome = ctx
                .redis
                .flush(&identity, query::flag(q, "confirm"))
                .await?;
            Ok(ApiSuccess::data(outcome).message("Redis cache flushed successfully"))
        }
        _ => Err(ApiError::Validation("Invalid action".to_string())),
    }
}
