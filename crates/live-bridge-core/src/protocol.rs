//! Signaling and negotiation wire protocol.
//!
//! The signaling channel is JSON-over-WebSocket. The server only pushes
//! `event` frames; negotiation happens over HTTP (`POST /offer`).

use serde::{Deserialize, Serialize};

use crate::types::{MIME_TEXT_PLAIN, ResponseMode};

/// Event name carrying the connection's session id right after connect.
pub const EVENT_HELLO: &str = "hello";

/// Event name carrying agent output (control and text deltas).
pub const EVENT_MESSAGE: &str = "message";

/// A signaling wire frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalingFrame {
    /// Server -> Client event.
    #[serde(rename = "event")]
    Event {
        event: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
}

impl SignalingFrame {
    pub fn event(event: &str, payload: Option<serde_json::Value>, seq: Option<u64>) -> Self {
        Self::Event {
            event: event.to_string(),
            payload,
            seq,
        }
    }
}

/// Payload of the `hello` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    pub session_id: String,
    pub version: String,
}

/// Agent output relayed to the client on the `message` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalingMessage {
    Control {
        turn_complete: bool,
        interrupted: bool,
    },
    Text {
        mime_type: String,
        data: String,
    },
}

impl SignalingMessage {
    pub fn control(turn_complete: bool, interrupted: bool) -> Self {
        Self::Control {
            turn_complete,
            interrupted,
        }
    }

    pub fn text_delta(data: impl Into<String>) -> Self {
        Self::Text {
            mime_type: MIME_TEXT_PLAIN.to_string(),
            data: data.into(),
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, Self::Control { .. })
    }
}

/// Body of `POST /offer`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferRequest {
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: String,
    #[serde(default)]
    pub response_type: ResponseMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// A session description as exchanged with the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            sdp_type: "offer".into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            sdp_type: "answer".into(),
        }
    }
}

/// Error body returned by HTTP endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
