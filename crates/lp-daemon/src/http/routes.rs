use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{Method, Uri};
use axum::middleware;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::http::envelope::ApiError;
use crate::http::gateway::{self, BODY_LIMIT};
use crate::state::AppContext;

/// Builds the full HTTP surface. Every panel operation lives under
/// `/api/{group}?action={op}`; the gateway middleware resolves the
/// session, enforces rate limits and validates CSRF tokens before any
/// handler runs.
pub fn router(ctx: Arc<AppContext>) -> Router {
    let api = Router::new()
        .route("/auth", get(handlers::auth::dispatch).post(handlers::auth::dispatch))
        .route("/vhost", get(handlers::vhost::dispatch).post(handlers::vhost::dispatch))
        .route(
            "/database",
            get(handlers::database::dispatch).post(handlers::database::dispatch),
        )
        .route("/php", get(handlers::php::dispatch).post(handlers::php::dispatch))
        .route("/system", get(handlers::system::dispatch).post(handlers::system::dispatch))
        .route(
            "/firewall",
            get(handlers::firewall::dispatch).post(handlers::firewall::dispatch),
        )
        .route("/redis", get(handlers::redis::dispatch).post(handlers::redis::dispatch))
        .route(
            "/settings",
            get(handlers::settings::dispatch).post(handlers::settings::dispatch),
        )
        .layer(middleware::from_fn_with_state(ctx.clone(), gateway::session_gateway));

    Router::new()
        .route("/health", get(health))
        .nest("/api", api)
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "litepanel",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn not_found(method: Method, uri: Uri) -> ApiError {
    tracing::debug!(%method, %uri, "No route matched");
    ApiError::NotFound("Endpoint not found".to_string())
}
