//! One dispatch function per route group. Each one switches on the
//! `action` query parameter the way the front-end calls the API:
//! `GET|POST /api/{group}?action={op}`. Read-only actions answer GET,
//! mutations answer POST; the wrong verb is a 405 and an unknown
//! action a 400.

pub mod auth;
pub mod database;
pub mod firewall;
pub mod php;
pub mod redis;
pub mod settings;
pub mod system;
pub mod vhost;

use axum::body::Bytes;
use axum::http::Method;
use serde::de::DeserializeOwned;

use crate::http::envelope::ApiError;

/// Mutating actions only answer POST, matching the front-end calls.
pub(crate) fn require_post(method: &Method) -> Result<(), ApiError> {
    if method == Method::POST {
        Ok(())
    } else {
        Err(ApiError::MethodNotAllowed)
    }
}

/// Decode a JSON request body. An empty body decodes as "every field
/// absent" so the services report which field is missing instead of a
/// generic parse failure.
pub(crate) fn parse_body<T>(body: &Bytes) -> Result<T, ApiError>
where
    T: DeserializeOwned + Default,
{
    if body.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| {
        tracing::debug!(error = %e, "Rejected malformed request body");
        ApiError::Validation("Invalid JSON body".to_string())
    })
}
