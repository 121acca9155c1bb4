//! Session gateway middleware for `/api/*`.
//!
//! Order per request: resolve the client IP, charge the rate limiter,
//! resolve the session cookie, enforce CSRF on authenticated mutations,
//! then attach the caller identity as request extensions. Handlers state
//! their own requirement through [`require_auth`] / [`require_admin`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, Method};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::error;

use lp_core::security::password;
use lp_db::models::User;
use lp_services::auth::AuthError;
use lp_services::RequestIdentity;

use crate::http::envelope::ApiError;
use crate::http::query;
use crate::state::AppContext;

pub const SESSION_COOKIE: &str = "litepanel_session";
const CSRF_HEADER: &str = "x-csrf-token";

/// Request bodies are buffered once for the CSRF check; anything larger
/// than this is rejected outright (SQL imports are the biggest payload).
pub const BODY_LIMIT: usize = 10 * 1024 * 1024;

/// The resolved session, when the cookie named a live one.
#[derive(Clone)]
pub struct CurrentSession {
    pub user: User,
    pub csrf_token: String,
    pub token: String,
}

/// Request extension carrying the optional session.
#[derive(Clone, Default)]
pub struct MaybeSession(pub Option<CurrentSession>);

pub fn require_auth(session: &MaybeSession) -> Result<&CurrentSession, ApiError> {
    session
        .0
        .as_ref()
        .ok_or_else(|| ApiError::Auth("Authentication required".to_string()))
}

pub fn require_admin(session: &MaybeSession) -> Result<&CurrentSession, ApiError> {
    let current = require_auth(session)?;
    if current.user.role != "admin" {
        return Err(ApiError::Forbidden("Admin access required".to_string()));
    }
    Ok(current)
}

pub async fn session_gateway(
    State(ctx): State<Arc<AppContext>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let ip = client_ip(request.headers(), peer);
    let user_agent = header_str(request.headers(), header::USER_AGENT.as_str());

    let action = query::param(request.uri().query(), "action");
    let class = endpoint_class(request.uri().path(), action.as_deref());
    let status = ctx.limiter.check(class, &ip).await;
    if !status.allowed {
        return ApiError::RateLimited(status).into_response();
    }

    let session = match resolve_session(&ctx, request.headers()).await {
        Ok(session) => session,
        Err(e) => return e.into_response(),
    };

    let mut request = request;
    if let Some(ref session) = session {
        if mutating(request.method()) {
            let (parts, body) = request.into_parts();
            let bytes = match axum::body::to_bytes(body, BODY_LIMIT).await {
                Ok(bytes) => bytes,
                Err(_) => {
                    return ApiError::Validation("Request body too large".to_string())
                        .into_response()
                }
            };

            let provided = header_str(&parts.headers, CSRF_HEADER)
                .or_else(|| body_csrf_token(&bytes));
            let valid = provided
                .as_deref()
                .is_some_and(|token| password::constant_time_eq(token, &session.csrf_token));
            if !valid {
                return ApiError::Csrf.into_response();
            }

            request = Request::from_parts(parts, Body::from(bytes));
        }
    }

    let identity = RequestIdentity {
        user_id: session.as_ref().map(|s| s.user.id),
        ip_address: Some(ip),
        user_agent,
    };
    request.extensions_mut().insert(identity);
    request.extensions_mut().insert(MaybeSession(session));

    // A dropped client connection cancels this future. Mutations are not
    // safely interruptible mid-effect, so they run to completion on
    // their own task and the outcome is persisted and audited even when
    // nobody is left to read the response.
    if mutating(request.method()) {
        return match tokio::spawn(next.run(request)).await {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "Request task failed");
                ApiError::Internal("Request handler failed".to_string()).into_response()
            }
        };
    }

    next.run(request).await
}

/// Resolve the session cookie. An absent, expired, or unknown token makes
/// the request anonymous; a suspended account and database failures are
/// surfaced instead of silently downgraded.
async fn resolve_session(
    ctx: &AppContext,
    headers: &HeaderMap,
) -> Result<Option<CurrentSession>, ApiError> {
    let Some(token) = cookie_value(headers, SESSION_COOKIE) else {
        return Ok(None);
    };
    match ctx.auth.check(&token).await {
        Ok(auth) => Ok(Some(CurrentSession {
            user: auth.user,
            csrf_token: auth.csrf_token,
            token,
        })),
        Err(AuthError::NotAuthenticated) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn mutating(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::DELETE)
}

/// Client address, preferring proxy headers over the socket peer:
/// `CF-Connecting-IP`, then the first `X-Forwarded-For` entry, then
/// `X-Real-IP`.
fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    if let Some(ip) = header_str(headers, "cf-connecting-ip") {
        let ip = ip.trim();
        if !ip.is_empty() {
            return ip.to_string();
        }
    }
    if let Some(forwarded) = header_str(headers, "x-forwarded-for") {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(ip) = header_str(headers, "x-real-ip") {
        let ip = ip.trim();
        if !ip.is_empty() {
            return ip.to_string();
        }
    }
    peer.ip().to_string()
}

/// Rate-limit class for a request path; the login action gets its own,
/// stricter budget.
fn endpoint_class(path: &str, action: Option<&str>) -> &'static str {
    let group = path
        .strip_prefix("/api/")
        .map(|rest| rest.split('/').next().unwrap_or(rest))
        .unwrap_or("");
    match group {
        "auth" => {
            if action == Some("login") {
                "login"
            } else {
                "auth"
            }
        }
        "vhost" => "vhost",
        "database" => "database",
        "php" => "php_extensions",
        "firewall" => "firewall",
        "redis" => "redis",
        "system" => "system",
        "settings" => "settings",
        _ => "default",
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    for pair in cookies.split(';') {
        let Some((key, value)) = pair.trim().split_once('=') else {
            continue;
        };
        if key == name {
            return Some(value.to_string());
        }
    }
    None
}

/// `csrf_token` field of a JSON request body, when there is one.
fn body_csrf_token(bytes: &Bytes) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
    value
        .get("csrf_token")
        .and_then(|token| token.as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::HeaderName::try_from(*name).unwrap(),
                value.parse().unwrap(),
            );
        }
        map
    }

    fn peer() -> SocketAddr {
        "203.0.113.9:54321".parse().unwrap()
    }

    #[test]
    fn test_client_ip_precedence() {
        let all = headers(&[
            ("cf-connecting-ip", "198.51.100.1"),
            ("x-forwarded-for", "198.51.100.2, 10.0.0.1"),
            ("x-real-ip", "198.51.100.3"),
        ]);
        assert_eq!(client_ip(&all, peer()), "198.51.100.1");

        let forwarded = headers(&[("x-forwarded-for", "198.51.100.2, 10.0.0.1")]);
        assert_eq!(client_ip(&forwarded, peer()), "198.51.100.2");

        let real = headers(&[("x-real-ip", "198.51.100.3")]);
        assert_eq!(client_ip(&real, peer()), "198.51.100.3");

        assert_eq!(client_ip(&HeaderMap::new(), peer()), "203.0.113.9");
    }

    #[test]
    fn test_blank_proxy_headers_fall_through() {
        let blank = headers(&[("cf-connecting-ip", " "), ("x-forwarded-for", "")]);
        assert_eq!(client_ip(&blank, peer()), "203.0.113.9");
    }

    #[test]
    fn test_endpoint_classes() {
        assert_eq!(endpoint_class("/api/auth", Some("login")), "login");
        assert_eq!(endpoint_class("/api/auth", Some("check")), "auth");
        assert_eq!(endpoint_class("/api/vhost", Some("create")), "vhost");
        assert_eq!(endpoint_class("/api/php", Some("list")), "php_extensions");
        assert_eq!(endpoint_class("/api/system", None), "system");
        assert_eq!(endpoint_class("/api/unknown", None), "default");
        assert_eq!(endpoint_class("/health", None), "default");
    }

    #[test]
    fn test_cookie_parsing() {
        let map = headers(&[(
            "cookie",
            "other=1; litepanel_session=abc123def; theme=dark",
        )]);
        assert_eq!(
            cookie_value(&map, SESSION_COOKIE).as_deref(),
            Some("abc123def")
        );
        assert_eq!(cookie_value(&map, "missing"), None);
        assert_eq!(cookie_value(&HeaderMap::new(), SESSION_COOKIE), None);

        let bare = headers(&[("cookie", "flag; litepanel_session=x")]);
        assert_eq!(cookie_value(&bare, SESSION_COOKIE).as_deref(), Some("x"));
    }

    #[test]
    fn test_body_csrf_token() {
        let body = Bytes::from(r#"{"domain":"a.com","csrf_token":"tok123"}"#);
        assert_eq!(body_csrf_token(&body).as_deref(), Some("tok123"));
        assert_eq!(body_csrf_token(&Bytes::from("not json")), None);
        assert_eq!(body_csrf_token(&Bytes::new()), None);
    }

    #[test]
    fn test_mutating_methods() {
        assert!(mutating(&Method::POST));
        assert!(mutating(&Method::PUT));
        assert!(mutating(&Method::DELETE));
        assert!(!mutating(&Method::GET));
        assert!(!mutating(&Method::HEAD));
    }
}
