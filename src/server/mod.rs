//! HTTP surface: health, metrics and the websocket delivery transport

mod session;

pub use session::handle_control;

use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum::{routing::get, Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{metrics, AppState};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_text))
        .route("/ws", get(ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind `config.listen_addr` and serve until the process exits
pub async fn serve(state: Arc<AppState>) -> anyhow::Result<()> {
    let addr: SocketAddr = state.config.listen_addr.parse()?;
    info!(addr = %addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "component": "arb-core",
        "connections": state.bus.connection_count(),
        "symbols": state.market.symbols(),
        "open_orders": state.orders.open_orders().len(),
        "parked_orders": state.router.parked_count(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn metrics_text() -> String {
    metrics::render()
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| session::run(socket, state))
}
