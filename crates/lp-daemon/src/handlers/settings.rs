use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, Uri};
use axum::Extension;

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
    let action = query::param(uri.query(), "action").unwrap_or_default();
    match action.as_str() {
        "list" => {
            let list = ctx.settings.list().await?;
            Ok(ApiSuccess::data(list).message("Settings retrieved successfully"))
        }
        "update" => {
            require_post(&method)?;
            let mut updates: BTreeMap<String, String> = parse_body(&body)?;
            // The CSRF token may ride in the body; it is not a setting.
            updates.remove("csrf_token");
            let outcome = ctx.settings.update(&identity, &updates).await?;
            Ok(ApiSuccess::data(outcome).message("Settings updated successfully"))
        }
        _ => Err(ApiError::Validation("Invalid action".to_string())),
    }
}
