use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, Uri};
use axum::Extension;
use serde::Deserialize;
use serde_json::json;

use lp_services::firewall::AddRuleRequest;
use lp_services::RequestIdentity;

use crate::handlers::{parse_body, require_post};
use crate::http::envelope::{ApiError, ApiSuccess};
use crate::http::gateway::{require_admin, MaybeSession};
use crate::http::query;
use crate::state::AppContext;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UpdateRuleBody {
    description: Option<String>,
}

/// UFW rule management plus enabling and disabling the firewall
/// itself. Disabling requires an explicit `confirm=true`.
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
            let status = ctx.firewall.status().await?;
            Ok(ApiSuccess::data(status).message("Firewall status retrieved"))
        }
        "list" => {
            let list = ctx.firewall.list().await?;
            Ok(ApiSuccess::data(list).message("Firewall rules retrieved successfully"))
        }
        "add" => {
            require_post(&method)?;
            let req: AddRuleRequest = parse_body(&body)?;
            let added = ctx.firewall.add(&identity, &req).await?;
            Ok(ApiSuccess::data(added).message("Firewall rule added successfully"))
        }
        "delete" => {
            require_post(&method)?;
            ctx.firewall
                .delete(&identity, &rule_id(q)?, query::flag(q, "confirm"))
                .await?;
            Ok(ApiSuccess::empty().message("Firewall rule deleted successfully"))
        }
        "enable" => {
            require_post(&method)?;
            let status = ctx.firewall.control(&identity, "enable", true).await?;
            Ok(ApiSuccess::data(status).message("Firewall enabled successfully"))
        }
        "disable" => {
            require_post(&method)?;
            let status = ctx
                .firewall
                .control(&identity, "disable", query::flag(q, "confirm"))
                .await?;
            Ok(ApiSuccess::data(status).message("Firewall disabled successfully"))
        }
        "toggle" => {
            require_post(&method)?;
            let id = rule_id(q)?;
            let enabled = ctx.firewall.toggle(&identity, &id).await?;
            let message = if enabled { "Rule enabled" } else { "Rule disabled" };
            Ok(ApiSuccess::data(json!({
                "rule_id": id,
                "enabled": enabled,
            }))
            .message(message))
        }
        "get_rule" => {
            let rule = ctx.firewall.get_rule(&rule_id(q)?).await?;
            Ok(ApiSuccess::data(rule).message("Firewall rule retrieved"))
        }
        "update_rule" => {
            require_post(&method)?;
            let id = rule_id(q)?;
            let req: UpdateRuleBody = parse_body(&body)?;
            ctx.firewall
                .update_rule(&identity, &id, req.description.as_deref())
                .await?;
            Ok(ApiSuccess::data(json!({ "rule_id": id }))
                .message("Firewall rule updated successfully"))
        }
        _ => Err(ApiError::Validation("Invalid action".to_string())),
    }
}

fn rule_id(query: Option<&str>) -> Result<String, ApiError> {
    query::param(query, "id")
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::Validation("Rule ID is required".to_string()))
}
