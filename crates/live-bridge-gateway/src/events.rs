//! Event delivery to signaling rooms.

use tracing::{debug, error};

use live_bridge_agent::SignalingSink;
use live_bridge_core::protocol::{EVENT_MESSAGE, SignalingFrame, SignalingMessage};

use crate::state::ConnectionRegistry;

/// Serialize an event frame.
pub fn event_frame(event: &str, payload: Option<serde_json::Value>) -> Option<String> {
    let frame = SignalingFrame::event(event, payload, None);
    match serde_json::to_string(&frame) {
        Ok(m) => Some(m),
        Err(e) => {
            error!(%e, "Failed to serialize event");
            None
        }
    }
}

/// Send an event to the connection named `room`.
pub fn emit_event(
    connections: &ConnectionRegistry,
    room: &str,
    event: &str,
    payload: Option<serde_json::Value>,
) -> bool {
    let Some(msg) = event_frame(event, payload) else {
        return false;
    };
    let sent = connections.send_to(room, msg);
    debug!(room, event, sent, "Emit event");
    sent
}

impl SignalingSink for ConnectionRegistry {
    fn emit(&self, room: &str, message: &SignalingMessage) -> bool {
        let payload = match serde_json::to_value(message) {
            Ok(v) => v,
            Err(e) => {
                error!(%e, "Failed to serialize signaling message");
                return false;
            }
        };
        emit_event(self, room, EVENT_MESSAGE, Some(payload))
    }
}
