//! WebSocket signaling connection lifecycle.
//!
//! Each connection is its own room: the server generates an id, announces it
//! in a `hello` event and uses it as the `sessionId` for offers. Closing the
//! socket tears down the session bound to that room.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use uuid::Uuid;

use live_bridge_core::protocol::{EVENT_HELLO, HelloPayload};

use crate::events::event_frame;
use crate::state::{ConnectionState, GatewayState};

/// Handle a new WebSocket connection.
pub async fn handle_ws_connection(state: Arc<GatewayState>, ws: WebSocket) {
    let conn_id = Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, "New signaling connection");

    #[cfg(feature = "metrics")]
    crate::metrics::record_ws_connect();

    let (mut ws_tx, mut ws_rx) = ws.split();

    // Create event channel for this connection
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<String>();

    state.connections.insert(ConnectionState {
        conn_id: conn_id.clone(),
        event_tx,
    });

    let hello = HelloPayload {
        session_id: conn_id.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    if let Some(msg) = event_frame(EVENT_HELLO, serde_json::to_value(&hello).ok()) {
        if ws_tx.send(Message::Text(msg.into())).await.is_err() {
            cleanup_connection(&state, &conn_id);
            return;
        }
    }

    // Spawn event sender task
    let send_task = tokio::spawn(async move {
        while let Some(msg) = event_rx.recv().await {
            if ws_tx.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    // Main read loop; the client has nothing to say beyond keepalives
    while let Some(msg_result) = ws_rx.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                debug!(conn_id = %conn_id, len = text.len(), "Ignoring client text frame");
            }
            Ok(Message::Close(_)) => {
                debug!(conn_id = %conn_id, "Client requested close");
                break;
            }
            Err(e) => {
                error!(conn_id = %conn_id, %e, "WebSocket error");
                break;
            }
            _ => {}
        }
    }

    // Cleanup
    send_task.abort();
    cleanup_connection(&state, &conn_id);
    info!(conn_id = %conn_id, "Signaling connection closed");
}

/// Drop the connection and tear down its session, if any.
fn cleanup_connection(state: &Arc<GatewayState>, conn_id: &str) {
    state.connections.remove(conn_id);
    if let Some(session) = state.sessions.remove(conn_id) {
        session.teardown();
    }

    #[cfg(feature = "metrics")]
    crate::metrics::record_ws_disconnect();
}
