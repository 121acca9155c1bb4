//! Daemon startup: config, database, state wiring, HTTP server.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{info, warn};

use lp_core::config::PanelConfig;
use lp_core::security::password;
use lp_db::{queries, schema};

use crate::http::{envelope, routes};
use crate::maintenance;
use crate::state::AppContext;

/// Password seeded for the `admin` account on a fresh install.
const DEFAULT_ADMIN_PASSWORD: &str = "admin123";
const DEFAULT_ADMIN_EMAIL: &str = "admin@localhost";

/// Run the LitePanel HTTP server. Shuts down gracefully on SIGTERM or
/// SIGINT.
pub async fn run() -> Result<()> {
    let config = PanelConfig::load().context("Failed to load panel configuration")?;
    envelope::set_debug(config.debug_mode);

    let listen: SocketAddr = config
        .listen_addr
        .parse()
        .context("Failed to parse listen address")?;

    let pool = lp_db::connect(&config.database_url)
        .await
        .context("Failed to connect to the panel database")?;

    let admin_hash = password::hash_password(DEFAULT_ADMIN_PASSWORD)
        .context("Failed to hash the default admin password")?;
    schema::initialize(&pool, &admin_hash, DEFAULT_ADMIN_EMAIL)
        .await
        .context("Failed to initialize the database schema")?;
    warn_if_default_admin_password(&pool).await;

    let ctx = AppContext::build(config, pool, listen).context("Failed to wire services")?;

    maintenance::spawn(ctx.clone());

    let app = routes::router(ctx);

    info!("Starting HTTP server on {}", listen);
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .context("Failed to bind listen address")?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("HTTP server error")?;

    info!("Server shut down gracefully");
    Ok(())
}

/// Nag at startup while the seeded admin password still works.
async fn warn_if_default_admin_password(pool: &sqlx::MySqlPool) {
    match queries::get_user_by_identifier(pool, "admin").await {
        Ok(Some(admin)) => {
            if password::verify_password(DEFAULT_ADMIN_PASSWORD, &admin.password_hash) {
                warn!("The admin account still uses the default password; change it immediately");
            }
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "Could not check the admin account password"),
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
