use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, Uri};
use axum::Extension;
use serde::Deserialize;
use serde_json::json;

use lp_services::RequestIdentity;

use crate::handlers::{parse_body, require_post};
use crate::http::envelope::{ApiError, ApiSuccess};
use crate::http::gateway::{require_admin, MaybeSession};
use crate::http::query;
use crate::state::AppContext;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ExtensionBody {
    extension: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ApplyBody {
    extensions: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SaveConfigBody {
    config: String,
}

/// PHP extension management and `php.ini` editing. The older action
/// spellings (`extensions`, `update_extensions`, `reload_php`) stay
/// routable so existing front-end calls keep working.
pub async fn dispatch(
    State(ctx): State<Arc<AppContext>>,
    Extension(identity): Extension<RequestIdentity>,
    Extension(session): Extension<MaybeSession>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Result<ApiSuccess, ApiError> {
    require_admin(&session)?;
    let action = query::param(uri.query(), "action").unwrap_or_default();
    match action.as_str() {
        "list" | "extensions" => {
            let list = ctx.extensions.list().await?;
            Ok(ApiSuccess::data(list).message("PHP extensions retrieved successfully"))
        }
        "install" => {
            require_post(&method)?;
            let req: ExtensionBody = parse_body(&body)?;
            let outcome = ctx.extensions.install(&identity, &req.extension).await?;
            Ok(ApiSuccess::data(outcome).message("Extension installed successfully"))
        }
        "toggle" => {
            require_post(&method)?;
            let req: ExtensionBody = parse_body(&body)?;
            let outcome = ctx.extensions.toggle(&identity, &req.extension).await?;
            let message = if outcome.enabled {
                "Extension enabled"
            } else {
                "Extension disabled"
            };
            Ok(ApiSuccess::data(outcome).message(message))
        }
        "apply_changes" | "update_extensions" => {
            require_post(&method)?;
            let req: ApplyBody = parse_body(&body)?;
            let outcome = ctx
                .extensions
                .apply_changes(&identity, &req.extensions)
                .await?;
            Ok(ApiSuccess::data(outcome).message("PHP extensions updated successfully"))
        }
        "get_config" => {
            let view = ctx.extensions.get_config().await?;
            Ok(ApiSuccess::data(view).message("PHP configuration retrieved"))
        }
        "save_config" => {
            require_post(&method)?;
            let req: SaveConfigBody = parse_body(&body)?;
            let outcome = ctx.extensions.save_config(&identity, &req.config).await?;
            Ok(ApiSuccess::data(outcome).message("PHP configuration saved successfully"))
        }
        "reload" | "reload_php" => {
            require_post(&method)?;
            ctx.extensions.reload(&identity).await?;
            Ok(ApiSuccess::data(json!({ "reloaded": true })).message("PHP reloaded successfully"))
        }
        _ => Err(ApiError::Validation("Invalid action".to_string())),
    }
}
