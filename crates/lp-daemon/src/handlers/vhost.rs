use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, Uri};
use axum::Extension;
use serde::Deserialize;
use serde_json::json;

use lp_services::vhost::{CreateVhostRequest, UpdateVhostRequest};
use lp_services::RequestIdentity;

use crate::handlers::{parse_body, require_post};
use crate::http::envelope::{ApiError, ApiSuccess};
use crate::http::gateway::{require_admin, MaybeSession};
use crate::http::query;
use crate::state::AppContext;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SslIssueBody {
    domain: String,
    email: String,
    force: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SslRenewBody {
    domain: String,
    force: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SslDomainBody {
    domain: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AutoRenewBody {
    domain: String,
    enabled: bool,
}

/// Virtual-host CRUD plus the certificate actions, which live here
/// because certificates are always scoped to one vhost's domain.
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
        "list" => {
            let list = ctx.vhosts.list().await?;
            Ok(ApiSuccess::data(list).message("Virtual hosts retrieved successfully"))
        }
        "get" => {
            let detail = ctx.vhosts.get(vhost_id(q)?).await?;
            Ok(ApiSuccess::data(detail).message("Virtual host retrieved successfully"))
        }
        "create" => {
            require_post(&method)?;
            let req: CreateVhostRequest = parse_body(&body)?;
            let created = ctx.vhosts.create(&identity, &req).await?;
            Ok(ApiSuccess::data(created).message("Virtual host created successfully"))
        }
        "update" => {
            require_post(&method)?;
            let req: UpdateVhostRequest = parse_body(&body)?;
            let updated = ctx.vhosts.update(&identity, vhost_id(q)?, &req).await?;
            Ok(ApiSuccess::data(updated).message("Virtual host updated successfully"))
        }
        "delete" => {
            require_post(&method)?;
            let deleted = ctx
                .vhosts
                .delete(
                    &identity,
                    vhost_id(q)?,
                    query::flag(q, "confirm"),
                    query::flag(q, "delete_database"),
                )
                .await?;
            Ok(ApiSuccess::data(deleted).message("Virtual host deleted successfully"))
        }
        "check_domain" => {
            let domain = query::param(q, "domain").unwrap_or_default();
            let check = ctx.vhosts.check_domain(&domain).await?;
            Ok(ApiSuccess::data(check).message("Domain check completed"))
        }
        "issue_ssl" => {
            require_post(&method)?;
            let req: SslIssueBody = parse_body(&body)?;
            let cert = ctx
                .ssl
                .issue(&identity, &req.domain, &req.email, req.force)
                .await?;
            Ok(ApiSuccess::data(cert).message("SSL certificate issued successfully"))
        }
        "renew_ssl" => {
            require_post(&method)?;
            let req: SslRenewBody = parse_body(&body)?;
            let cert = ctx.ssl.renew(&identity, &req.domain, req.force).await?;
            Ok(ApiSuccess::data(cert).message("SSL certificate renewed successfully"))
        }
        "renew_all_ssl" => {
            require_post(&method)?;
            let outcome = ctx.ssl.renew_all(&identity).await?;
            Ok(ApiSuccess::data(outcome).message("Certificate renewal completed"))
        }
        "remove_ssl" => {
            require_post(&method)?;
            let req: SslDomainBody = parse_body(&body)?;
            ctx.ssl.remove(&identity, &req.domain).await?;
            Ok(ApiSuccess::empty().message("SSL certificate removed successfully"))
        }
        "ssl_info" => {
            let domain = query::param(q, "domain").unwrap_or_default();
            if domain.is_empty() {
                return Err(ApiError::Validation("Domain is required".to_string()));
            }
            let cert = ctx.ssl.cert_info(&domain).await?;
            Ok(ApiSuccess::data(cert).message("SSL certificate information retrieved"))
        }
        "ssl_list" => {
            let certs = ctx.ssl.list_certificates().await?;
            let total = certs.len();
            Ok(ApiSuccess::data(json!({
                "certificates": certs,
                "total": total,
            }))
            .message("SSL certificates retrieved successfully"))
        }
        "ssl_stats" => {
            let stats = ctx.ssl.statistics().await?;
            Ok(ApiSuccess::data(stats).message("SSL statistics retrieved"))
        }
        "set_auto_renew" => {
            require_post(&method)?;
            let req: AutoRenewBody = parse_body(&body)?;
            ctx.ssl
                .set_auto_renew(&identity, &req.domain, req.enabled)
                .await?;
            Ok(ApiSuccess::data(json!({
                "domain": req.domain,
                "auto_renew": req.enabled,
            }))
            .message("Auto-renew setting updated"))
        }
        _ => Err(ApiError::Validation("Invalid action".to_string())),
    }
}

fn vhost_id(query: Option<&str>) -> Result<i64, ApiError> {
    query::int(query, "id")
        .ok_or_else(|| ApiError::Validation("Virtual host ID is required".to_string()))
}
