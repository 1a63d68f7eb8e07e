//! Dashboard: Axum web server exposing the engine over JSON.
//!
//! CORS enabled for local development.

pub mod routes;

use anyhow::{Context, Result};
use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use routes::AppState;

/// Start the dashboard web server.
///
/// Binds before returning so a busy port is reported to the caller; the
/// server itself runs on a background task.
pub async fn spawn_dashboard(state: AppState, port: u16) -> Result<()> {
    let app = build_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind dashboard port {port}"))?;

    info!(port, "Dashboard server starting on http://localhost:{port}");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Dashboard server error");
        }
    });

    Ok(())
}

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(routes::health))
        .route("/api/status", get(routes::get_status))
        // Arbitrage
        .route("/api/arbitrage/scan", post(routes::scan))
        .route("/api/arbitrage/assets", get(routes::list_assets))
        .route("/api/arbitrage/execute", post(routes::execute_chain))
        .route("/api/arbitrage/executions", get(routes::list_executions))
        // Tasks
        .route("/api/tasks", get(routes::list_tasks).post(routes::create_task))
        .route("/api/tasks/:id", get(routes::get_task).delete(routes::delete_task))
        .route("/api/tasks/:id/start", post(routes::start_task))
        .route("/api/tasks/:id/stop", post(routes::stop_task))
        .route("/api/tasks/:id/statistics", get(routes::task_statistics))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
