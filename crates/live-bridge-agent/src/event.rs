//! Agent output events and their routing.

use bytes::Bytes;

use live_bridge_core::protocol::SignalingMessage;
use live_bridge_core::types::{
    AudioChunk, DEFAULT_AGENT_OUTPUT_RATE, MIME_AUDIO_PCM, MIME_TEXT_PLAIN,
};

/// One event from a live agent session, classified once at the connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// Turn boundary signals. Carries no content.
    Control { turn_complete: bool, interrupted: bool },
    Content(ContentEvent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentEvent {
    pub mime_type: String,
    pub payload: ContentPayload,
    /// Whether this is an incremental piece of a longer response.
    pub is_partial: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPayload {
    Text(String),
    Binary(Bytes),
}

impl AgentEvent {
    pub fn control(turn_complete: bool, interrupted: bool) -> Self {
        Self::Control {
            turn_complete,
            interrupted,
        }
    }

    pub fn text(text: impl Into<String>, is_partial: bool) -> Self {
        Self::Content(ContentEvent {
            mime_type: MIME_TEXT_PLAIN.into(),
            payload: ContentPayload::Text(text.into()),
            is_partial,
        })
    }

    pub fn binary(mime_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self::Content(ContentEvent {
            mime_type: mime_type.into(),
            payload: ContentPayload::Binary(data.into()),
            is_partial: false,
        })
    }
}

/// Where an event goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Signaling channel, turn boundary.
    Control(SignalingMessage),
    /// Outbound audio pacer, tagged with the rate the agent declared.
    Audio(AudioChunk),
    /// Signaling channel, text delta.
    Text(SignalingMessage),
    Drop,
}

impl Route {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Control(_) => "control",
            Self::Audio(_) => "audio",
            Self::Text(_) => "text",
            Self::Drop => "drop",
        }
    }
}

/// Classify an event. Control wins outright; content is only inspected for
/// non-control events.
pub fn route(event: AgentEvent) -> Route {
    match event {
        AgentEvent::Control {
            turn_complete,
            interrupted,
        } => {
            if turn_complete || interrupted {
                Route::Control(SignalingMessage::control(turn_complete, interrupted))
            } else {
                Route::Drop
            }
        }
        AgentEvent::Content(content) => match content.payload {
            ContentPayload::Binary(data) if content.mime_type.starts_with(MIME_AUDIO_PCM) => {
                if data.is_empty() {
                    Route::Drop
                } else {
                    Route::Audio(AudioChunk::from_pcm_mime(
                        &content.mime_type,
                        data,
                        DEFAULT_AGENT_OUTPUT_RATE,
                    ))
                }
            }
            ContentPayload::Text(text) if content.is_partial && !text.is_empty() => {
                Route::Text(SignalingMessage::text_delta(text))
            }
            _ => Route::Drop,
        },
    }
}
