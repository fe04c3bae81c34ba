//! Axum HTTP + WebSocket server.

use std::future::Future;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use live_bridge_core::protocol::OfferRequest;

use crate::connection::handle_ws_connection;
use crate::offer::negotiate;
use crate::state::GatewayState;

/// Build the gateway router.
pub fn build_router(state: Arc<GatewayState>) -> anyhow::Result<Router> {
    let cors = state.config.cors_enabled();

    #[allow(unused_mut)]
    let mut app = Router::new()
        .route("/offer", post(offer_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    #[cfg(feature = "metrics")]
    {
        let handle = crate::metrics::install_prometheus_recorder()?;
        app = app.route("/metrics", get(move || async move { handle.render() }));
    }

    let app = app.layer(TraceLayer::new_for_http());
    Ok(if cors {
        app.layer(CorsLayer::permissive())
    } else {
        app
    })
}

/// Start the gateway and serve until Ctrl-C.
pub async fn start_gateway(state: Arc<GatewayState>, port: u16) -> anyhow::Result<()> {
    serve(state, port, shutdown_signal()).await
}

/// Serve until `shutdown` resolves, then tear down all sessions.
pub async fn serve(
    state: Arc<GatewayState>,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let bind_addr = state.config.gateway_bind();
    let app = build_router(state.clone())?;

    let addr = format!("{bind_addr}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Gateway listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    let closed = state.shutdown_sessions();
    info!(sessions = closed, "Gateway stopped");
    Ok(())
}

async fn offer_handler(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<OfferRequest>,
) -> Response {
    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    let result = negotiate(&state, req).await;

    #[cfg(feature = "metrics")]
    crate::metrics::record_offer(
        if result.is_ok() { "ok" } else { "error" },
        start.elapsed().as_secs_f64(),
    );

    match result {
        Ok(answer) => Json(answer).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(state, socket))
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let version = env!("CARGO_PKG_VERSION");

    Json(json!({
        "status": "ok",
        "version": version,
        "sessions": state.sessions.len(),
        "connections": state.connections.len(),
    }))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(%e, "Failed to install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
