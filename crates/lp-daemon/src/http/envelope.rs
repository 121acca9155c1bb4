//! JSON response envelope and the API error taxonomy.
//!
//! Every response is `{success, message, data}` on the happy path and
//! `{success: false, message, errors}` on failure. Service errors convert
//! into [`ApiError`] via `From`; the conversion alone decides the status
//! code and the user-visible message, so handlers never hand-pick status
//! codes.

use std::sync::atomic::{AtomicBool, Ordering};

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::error;

use lp_db::DbError;
use lp_services::auth::AuthError;
use lp_services::backup::BackupError;
use lp_services::database::DatabaseError;
use lp_services::firewall::FirewallError;
use lp_services::phpext::PhpExtError;
use lp_services::redis::RedisError;
use lp_services::settings::SettingsError;
use lp_services::ssl::SslError;
use lp_services::system::SystemError;
use lp_services::vhost::VhostError;
use lp_services::RateStatus;

/// Mirrors the config `debug_mode` flag; set once at startup.
static DEBUG: AtomicBool = AtomicBool::new(false);

pub fn set_debug(enabled: bool) {
    DEBUG.store(enabled, Ordering::Relaxed);
}

fn debug_enabled() -> bool {
    DEBUG.load(Ordering::Relaxed)
}

#[derive(Serialize)]
struct Envelope {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    errors: Option<Value>,
}

/// Successful response under construction. Handlers return this and the
/// conversion renders the envelope.
pub struct ApiSuccess {
    message: Option<String>,
    data: Option<Value>,
    cookies: Vec<String>,
}

impl ApiSuccess {
    /// No payload. Rendered as `data: []`, the shape the front-end
    /// receives from actions that only report a message.
    pub fn empty() -> Self {
        Self {
            message: None,
            data: Some(Value::Array(Vec::new())),
            cookies: Vec::new(),
        }
    }

    pub fn data(value: impl Serialize) -> Self {
        let data = match serde_json::to_value(value) {
            Ok(value) => Some(value),
            Err(e) => {
                error!(error = %e, "Failed to serialize response data");
                None
            }
        };
        Self {
            message: None,
            data,
            cookies: Vec::new(),
        }
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Append a `Set-Cookie` header (session issue and teardown).
    pub fn cookie(mut self, cookie: String) -> Self {
        self.cookies.push(cookie);
        self
    }
}

impl IntoResponse for ApiSuccess {
    fn into_response(self) -> Response {
        let body = Envelope {
            success: true,
            message: self.message.unwrap_or_else(|| "Success".to_string()),
            data: self.data,
            errors: None,
        };
        let mut response = (StatusCode::OK, Json(body)).into_response();
        for cookie in self.cookies {
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                response.headers_mut().append(header::SET_COOKIE, value);
            }
        }
        response
    }
}

/// Failure taxonomy for the whole HTTP surface.
#[derive(Debug)]
pub enum ApiError {
    /// Bad input, missing confirmation, or a duplicate folded into its
    /// operator-facing message.
    Validation(String),
    /// Not logged in, or credentials rejected.
    Auth(String),
    /// Logged in but not allowed.
    Forbidden(String),
    Csrf,
    NotFound(String),
    MethodNotAllowed,
    /// Unique-key conflict; rendered as 400 with the duplicate message.
    Conflict(String),
    RateLimited(RateStatus),
    /// An external command or host resource failed; the message is
    /// already operator-facing.
    External(String),
    /// Unexpected failure. The detail reaches the client only in debug
    /// mode; it is always logged.
    Internal(String),
    NotImplemented(String),
    /// The external change landed but a follow-up step did not. Not a
    /// failure: rendered as a 200 whose message says what still needs
    /// attention.
    Partial(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Partial(message) => {
                let body = Envelope {
                    success: true,
                    message,
                    data: Some(json!({ "partial": true })),
                    errors: None,
                };
                (StatusCode::OK, Json(body)).into_response()
            }
            ApiError::RateLimited(status) => rate_limited(status),
            ApiError::Internal(detail) => {
                error!(detail, "Internal error reached the HTTP surface");
                let errors = debug_enabled().then(|| json!([detail]));
                failure(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal error occurred".to_string(),
                    errors,
                )
            }
            ApiError::Validation(message) | ApiError::Conflict(message) => {
                failure(StatusCode::BAD_REQUEST, message, None)
            }
            ApiError::Auth(message) => failure(StatusCode::UNAUTHORIZED, message, None),
            ApiError::Forbidden(message) => failure(StatusCode::FORBIDDEN, message, None),
            ApiError::Csrf => failure(
                StatusCode::FORBIDDEN,
                "Invalid CSRF token".to_string(),
                None,
            ),
            ApiError::NotFound(message) => failure(StatusCode::NOT_FOUND, message, None),
            ApiError::MethodNotAllowed => failure(
                StatusCode::METHOD_NOT_ALLOWED,
                "Method not allowed".to_string(),
                None,
            ),
            ApiError::External(message) => {
                failure(StatusCode::INTERNAL_SERVER_ERROR, message, None)
            }
            ApiError::NotImplemented(message) => {
                failure(StatusCode::NOT_IMPLEMENTED, message, None)
            }
        }
    }
}

fn failure(status: StatusCode, message: String, errors: Option<Value>) -> Response {
    let body = Envelope {
        success: false,
        message,
        data: None,
        errors,
    };
    (status, Json(body)).into_response()
}

/// 429 with the standard `X-RateLimit-*` headers and `Retry-After`.
fn rate_limited(status: RateStatus) -> Response {
    let body = Envelope {
        success: false,
        message: "Rate limit exceeded. Please try again later.".to_string(),
        data: None,
        errors: Some(json!({
            "limit": status.limit,
            "remaining": status.remaining,
            "reset": status.reset_secs,
        })),
    };
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    for (name, value) in [
        ("x-ratelimit-limit", status.limit.to_string()),
        ("x-ratelimit-remaining", status.remaining.to_string()),
        ("x-ratelimit-reset", status.reset_secs.to_string()),
        ("retry-after", status.reset_secs.max(0).to_string()),
    ] {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }
    response
}

impl From<DbError> for ApiError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound(message) => ApiError::NotFound(message),
            DbError::Duplicate(message) => ApiError::Conflict(message),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Validation(message) => ApiError::Validation(message),
            e @ (AuthError::InvalidCredentials
            | AuthError::AccountLocked
            | AuthError::NotAuthenticated) => ApiError::Auth(e.to_string()),
            e @ AuthError::AccountSuspended => ApiError::Forbidden(e.to_string()),
            e @ AuthError::NotImplemented => ApiError::NotImplemented(e.to_string()),
            AuthError::Database(e) => e.into(),
        }
    }
}

impl From<VhostError> for ApiError {
    fn from(e: VhostError) -> Self {
        match e {
            VhostError::Validation(message) => ApiError::Validation(message),
            e @ VhostError::NotFound => ApiError::NotFound(e.to_string()),
            VhostError::Partial(message) => ApiError::Partial(message),
            VhostError::External(message) => ApiError::External(message),
            e @ VhostError::Config(_) => ApiError::External(e.to_string()),
            VhostError::Database(e) => e.into(),
        }
    }
}

impl From<SslError> for ApiError {
    fn from(e: SslError) -> Self {
        match e {
            SslError::Validation(message) => ApiError::Validation(message),
            e @ (SslError::VhostNotFound | SslError::NoCertificate) => {
                ApiError::NotFound(e.to_string())
            }
            e @ SslError::CertbotMissing => ApiError::External(e.to_string()),
            SslError::Partial(message) => ApiError::Partial(message),
            SslError::External(message) => ApiError::External(message),
            SslError::Database(e) => e.into(),
        }
    }
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::Validation(message) => ApiError::Validation(message),
            e @ DatabaseError::NotFound => ApiError::NotFound(e.to_string()),
            DatabaseError::Partial(message) => ApiError::Partial(message),
            DatabaseError::External(message) => ApiError::External(message),
            DatabaseError::Database(e) => e.into(),
        }
    }
}

impl From<PhpExtError> for ApiError {
    fn from(e: PhpExtError) -> Self {
        match e {
            PhpExtError::Validation(message) => ApiError::Validation(message),
            e @ PhpExtError::IniNotFound => ApiError::NotFound(e.to_string()),
            PhpExtError::External(message) => ApiError::External(message),
            e @ PhpExtError::Config(_) => ApiError::External(e.to_string()),
            PhpExtError::Database(e) => e.into(),
        }
    }
}

impl From<FirewallError> for ApiError {
    fn from(e: FirewallError) -> Self {
        match e {
            FirewallError::Validation(message) => ApiError::Validation(message),
            e @ FirewallError::NotFound => ApiError::NotFound(e.to_string()),
            FirewallError::Partial(message) => ApiError::Partial(message),
            FirewallError::External(message) => ApiError::External(message),
            FirewallError::Database(e) => e.into(),
        }
    }
}

impl From<RedisError> for ApiError {
    fn from(e: RedisError) -> Self {
        match e {
            RedisError::Validation(message) => ApiError::Validation(message),
            e @ RedisError::ConfNotFound => ApiError::NotFound(e.to_string()),
            RedisError::Partial(message) => ApiError::Partial(message),
            RedisError::External(message) => ApiError::External(message),
            e @ RedisError::Config(_) => ApiError::External(e.to_string()),
            RedisError::Database(e) => e.into(),
        }
    }
}

impl From<BackupError> for ApiError {
    fn from(e: BackupError) -> Self {
        match e {
            BackupError::Validation(message) => ApiError::Validation(message),
            e @ BackupError::NotFound => ApiError::NotFound(e.to_string()),
            BackupError::Partial(message) => ApiError::Partial(message),
            BackupError::External(message) => ApiError::External(message),
            BackupError::Database(e) => e.into(),
        }
    }
}

impl From<SystemError> for ApiError {
    fn from(e: SystemError) -> Self {
        match e {
            SystemError::Validation(message) => ApiError::Validation(message),
            SystemError::External(message) => ApiError::External(message),
            SystemError::Database(e) => e.into(),
        }
    }
}

impl From<SettingsError> for ApiError {
    fn from(e: SettingsError) -> Self {
        match e {
            SettingsError::Validation(message) => ApiError::Validation(message),
            SettingsError::Database(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_success_envelope_defaults() {
        let response = ApiSuccess::data(json!({"id": 7})).into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["message"], json!("Success"));
        assert_eq!(body["data"]["id"], json!(7));
        assert!(body.get("errors").is_none());

        let response = ApiSuccess::empty().message("Done").into_response();
        let body = body_json(response).await;
        assert_eq!(body["message"], json!("Done"));
        assert_eq!(body["data"], json!([]));
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let cases = [
            (ApiError::Validation("bad".into()), StatusCode::BAD_REQUEST),
            (ApiError::Auth("no".into()), StatusCode::UNAUTHORIZED),
            (ApiError::Csrf, StatusCode::FORBIDDEN),
            (ApiError::Forbidden("no".into()), StatusCode::FORBIDDEN),
            (ApiError::NotFound("gone".into()), StatusCode::NOT_FOUND),
            (ApiError::MethodNotAllowed, StatusCode::METHOD_NOT_ALLOWED),
            (
                ApiError::Conflict("Domain already exists".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::External("ufw failed".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                ApiError::NotImplemented("later".into()),
                StatusCode::NOT_IMPLEMENTED,
            ),
        ];
        for (error, expected) in cases {
            assert_eq!(error.into_response().status(), expected);
        }
    }

    #[tokio::test]
    async fn test_partial_renders_as_success() {
        let response =
            ApiError::Partial("Rule added but failed to save to database".into()).into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["data"]["partial"], json!(true));
        assert_eq!(
            body["message"],
            json!("Rule added but failed to save to database")
        );
    }

    #[tokio::test]
    async fn test_rate_limited_headers() {
        let status = RateStatus {
            allowed: false,
            limit: 30,
            remaining: 0,
            reset_secs: 42,
        };
        let response = ApiError::RateLimited(status).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["x-ratelimit-limit"], "30");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
        assert_eq!(response.headers()["x-ratelimit-reset"], "42");
        assert_eq!(response.headers()["retry-after"], "42");
    }

    #[tokio::test]
    async fn test_duplicate_folds_to_bad_request() {
        let error: ApiError = DbError::Duplicate("Domain already exists".to_string()).into();
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["message"], json!("Domain already exists"));
    }

    #[tokio::test]
    async fn test_auth_error_messages_survive() {
        let locked: ApiError = AuthError::AccountLocked.into();
        let response = locked.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(
            body["message"],
            json!("Account is temporarily locked. Please try again later.")
        );

        let suspended: ApiError = AuthError::AccountSuspended.into();
        assert_eq!(suspended.into_response().status(), StatusCode::FORBIDDEN);
    }
}
