use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, Uri};
use axum::Extension;
use serde::Deserialize;
use serde_json::json;

use lp_db::models::PublicUser;
use lp_services::RequestIdentity;

use crate::handlers::{parse_body, require_post};
use crate::http::envelope::{ApiError, ApiSuccess};
use crate::http::gateway::{MaybeSession, SESSION_COOKIE};
use crate::http::query;
use crate::state::AppContext;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LoginBody {
    username: String,
    password: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RegisterBody {
    username: String,
    email: String,
    password: String,
    confirm_password: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ForgotPasswordBody {
    email: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ResetPasswordBody {
    token: String,
    password: String,
    confirm_password: String,
}

pub async fn dispatch(
    State(ctx): State<Arc<AppContext>>,
    Extension(identity): Extension<RequestIdentity>,
    Extension(session): Extension<MaybeSession>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Result<ApiSuccess, ApiError> {
    let action = query::param(uri.query(), "action").unwrap_or_default();
    match action.as_str() {
        "login" => {
            require_post(&method)?;
            login(&ctx, &identity, &body).await
        }
        "logout" => logout(&ctx, &identity, &session).await,
        "check" => Ok(check(&session)),
        "register" => {
            require_post(&method)?;
            register(&ctx, &identity, &body).await
        }
        "forgot_password" => {
            require_post(&method)?;
            forgot_password(&ctx, &identity, &body).await
        }
        "reset_password" => {
            require_post(&method)?;
            reset_password(&ctx, &body).await
        }
        _ => Err(ApiError::Validation("Invalid action".to_string())),
    }
}

async fn login(
    ctx: &AppContext,
    identity: &RequestIdentity,
    body: &Bytes,
) -> Result<ApiSuccess, ApiError> {
    let input: LoginBody = parse_body(body)?;
    let session = ctx
        .auth
        .login(identity, &input.username, &input.password)
        .await?;

    let cookie = format!(
        "{SESSION_COOKIE}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        session.token, ctx.config.sessions.lifetime_secs,
    );
    Ok(ApiSuccess::data(json!({
        "user": session.user,
        "csrf_token": session.csrf_token,
    }))
    .message("Login successful")
    .cookie(cookie))
}

async fn logout(
    ctx: &AppContext,
    identity: &RequestIdentity,
    session: &MaybeSession,
) -> Result<ApiSuccess, ApiError> {
    if let Some(current) = &session.0 {
        ctx.auth.logout(identity, &current.token).await?;
    }
    let cookie = format!("{SESSION_COOKIE}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0");
    Ok(ApiSuccess::empty()
        .message("Logged out successfully")
        .cookie(cookie))
}

/// Always answers 200; the payload says whether the cookie named a live
/// session. The front-end polls this on page load to pick up the CSRF
/// token.
fn check(session: &MaybeSession) -> ApiSuccess {
    match &session.0 {
        Some(current) => ApiSuccess::data(json!({
            "authenticated": true,
            "user": PublicUser::from(&current.user),
            "csrf_token": current.csrf_token,
        }))
        .message("Authenticated"),
        None => {
            ApiSuccess::data(json!({ "authenticated": false })).message("Not authenticated")
        }
    }
}

async fn register(
    ctx: &AppContext,
    identity: &RequestIdentity,
    body: &Bytes,
) -> Result<ApiSuccess, ApiError> {
    let input: RegisterBody = parse_body(body)?;
    let user_id = ctx
        .auth
        .register(
            identity,
            &input.username,
            &input.email,
            &input.password,
            &input.confirm_password,
        )
        .await?;
    Ok(ApiSuccess::data(json!({ "user_id": user_id })).message("Registration successful"))
}

async fn forgot_password(
    ctx: &AppContext,
    identity: &RequestIdentity,
    body: &Bytes,
) -> Result<ApiSuccess, ApiError> {
    let input: ForgotPasswordBody = parse_body(body)?;
    ctx.auth
        .request_password_reset(identity, &input.email)
        .await?;
    Ok(ApiSuccess::data(json!({
        "message": "If the email exists, a password reset link has been sent",
    }))
    .message("Password reset initiated"))
}

async fn reset_password(ctx: &AppContext, body: &Bytes) -> Result<ApiSuccess, ApiError> {
    let input: ResetPasswordBody = parse_body(body)?;
    if input.token.is_empty() || input.password.is_empty() {
        return Err(ApiError::Validation(
            "Token and password are required".to_string(),
        ));
    }
    if input.password != input.confirm_password {
        return Err(ApiError::Validation("Passwords do not match".to_string()));
    }
    ctx.auth
        .reset_password(&input.token, &input.password)
        .await?;
    Ok(ApiSuccess::empty())
}
