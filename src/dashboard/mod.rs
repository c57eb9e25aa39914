//! Dashboard: Axum server for the status API and the live log stream.
//!
//! CORS is open so a locally served frontend can connect.

pub mod routes;

use anyhow::{Context, Result};
use axum::{
    http::{header, Method},
    routing::get,
    Router,
};
use std::net::SocketAddr;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

pub use routes::{AppState, DashboardState};

/// Bind the dashboard port and serve in a background task.
///
/// Returns once the listener is bound, so a port clash fails startup.
pub async fn spawn_dashboard(state: AppState, port: u16) -> Result<SocketAddr> {
    let app = build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind dashboard port {port}"))?;
    let local = listener.local_addr().context("Dashboard listener address")?;

    info!(port = local.port(), "Dashboard server listening on http://localhost:{}", local.port());

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Dashboard server error");
        }
    });

    Ok(local)
}

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/api/status", get(routes::get_status))
        .route("/health", get(routes::health))
        .route("/ws", get(routes::ws_handler))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
