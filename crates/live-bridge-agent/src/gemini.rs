//! Gemini Live connector.
//!
//! Speaks the `BidiGenerateContent` WebSocket protocol: a `setup` message
//! selects model and response modality, `realtimeInput` carries base64 audio
//! and JPEG frames, and `serverContent` messages are classified into
//! [`AgentEvent`]s. Auth is via API key in the query string.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

use live_bridge_core::config::AgentConfig;
use live_bridge_core::error::BridgeError;
use live_bridge_core::types::{MIME_AUDIO_PCM, MIME_IMAGE_JPEG, RealtimeBlob, ResponseMode};

use crate::event::AgentEvent;
use crate::session::{AgentConnector, EventStream, RealtimeInputQueue};

const DEFAULT_BASE_URL: &str = "wss://generativelanguage.googleapis.com";
const LIVE_PATH: &str =
    "/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
pub const DEFAULT_LIVE_MODEL: &str = "models/gemini-2.0-flash-live-001";
const SETUP_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct GeminiLiveConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub instruction: Option<String>,
    pub voice: Option<String>,
    /// Rate of the 16-bit PCM produced by ingress.
    pub input_sample_rate: u32,
}

impl GeminiLiveConfig {
    pub fn from_agent_config(
        agent: &AgentConfig,
        input_sample_rate: u32,
    ) -> Result<Self, BridgeError> {
        let api_key = agent.resolve_api_key().ok_or_else(|| {
            BridgeError::Config(
                "no Gemini API key; set agent.api_key or GOOGLE_API_KEY".to_string(),
            )
        })?;

        let model = agent
            .model
            .clone()
            .unwrap_or_else(|| DEFAULT_LIVE_MODEL.to_string());
        let model = if model.starts_with("models/") {
            model
        } else {
            format!("models/{model}")
        };

        Ok(Self {
            api_key,
            model,
            base_url: agent
                .base_url
                .as_deref()
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            instruction: agent.instruction.clone(),
            voice: agent.voice.clone(),
            input_sample_rate,
        })
    }
}

pub struct GeminiLiveConnector {
    config: GeminiLiveConfig,
}

impl GeminiLiveConnector {
    pub fn new(config: GeminiLiveConfig) -> Self {
        Self { config }
    }

    fn endpoint(&self) -> String {
        format!("{}{}?key={}", self.config.base_url, LIVE_PATH, self.config.api_key)
    }

    fn setup_message(&self, mode: ResponseMode) -> Value {
        let modality = match mode {
            ResponseMode::Audio => "AUDIO",
            ResponseMode::Text => "TEXT",
        };

        let mut generation_config = json!({ "responseModalities": [modality] });
        if let (ResponseMode::Audio, Some(voice)) = (mode, &self.config.voice) {
            generation_config["speechConfig"] = json!({
                "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": voice } }
            });
        }

        let mut setup = json!({
            "model": self.config.model,
            "generationConfig": generation_config,
        });
        if let Some(instruction) = &self.config.instruction {
            setup["systemInstruction"] = json!({ "parts": [{ "text": instruction }] });
        }

        json!({ "setup": setup })
    }
}

/// Wrap a realtime blob for the wire. Unsupported types yield `None`.
fn realtime_input_message(blob: &RealtimeBlob, input_sample_rate: u32) -> Option<Value> {
    let data = BASE64.encode(&blob.data);
    if blob.mime_type.starts_with(MIME_AUDIO_PCM) {
        let mime_type = if blob.mime_type.contains("rate=") {
            blob.mime_type.clone()
        } else {
            format!("{MIME_AUDIO_PCM};rate={input_sample_rate}")
        };
        Some(json!({
            "realtimeInput": { "audio": { "mimeType": mime_type, "data": data } }
        }))
    } else if blob.mime_type == MIME_IMAGE_JPEG {
        Some(json!({
            "realtimeInput": { "video": { "mimeType": MIME_IMAGE_JPEG, "data": data } }
        }))
    } else {
        None
    }
}

// --- Server message types ---

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    #[serde(default)]
    setup_complete: Option<Value>,
    #[serde(default)]
    server_content: Option<ServerContent>,
    #[serde(default)]
    go_away: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    #[serde(default)]
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    turn_complete: bool,
    #[serde(default)]
    interrupted: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

/// Turn one `serverContent` into events: content parts first, then a single
/// control event if the turn ended or was interrupted.
fn classify(content: ServerContent) -> anyhow::Result<Vec<AgentEvent>> {
    let mut events = Vec::new();
    for part in content.model_turn.map(|t| t.parts).unwrap_or_default() {
        if let Some(text) = part.text {
            events.push(AgentEvent::text(text, true));
        }
        if let Some(inline) = part.inline_data {
            let bytes = BASE64.decode(inline.data.as_bytes())?;
            events.push(AgentEvent::binary(inline.mime_type, bytes));
        }
    }
    if content.turn_complete || content.interrupted {
        events.push(AgentEvent::control(content.turn_complete, content.interrupted));
    }
    Ok(events)
}

enum Inbound {
    Server(ServerMessage),
    Closed(Option<String>),
    Skip,
}

fn decode_frame(msg: Message) -> anyhow::Result<Inbound> {
    Ok(match msg {
        Message::Text(text) => Inbound::Server(serde_json::from_str(text.as_str())?),
        Message::Binary(data) => Inbound::Server(serde_json::from_slice(&data)?),
        Message::Close(frame) => Inbound::Closed(frame.map(|f| f.reason.as_str().to_string())),
        _ => Inbound::Skip,
    })
}

#[async_trait]
impl AgentConnector for GeminiLiveConnector {
    fn name(&self) -> &str {
        "gemini-live"
    }

    async fn open(&self, mode: ResponseMode) -> anyhow::Result<(RealtimeInputQueue, EventStream)> {
        let (ws, _) = connect_async(self.endpoint())
            .await
            .map_err(|e| anyhow::anyhow!("Gemini Live connect failed: {e}"))?;
        let (mut ws_tx, mut ws_rx) = ws.split();

        ws_tx
            .send(Message::Text(self.setup_message(mode).to_string().into()))
            .await?;

        tokio::time::timeout(SETUP_TIMEOUT, async {
            while let Some(msg) = ws_rx.next().await {
                match decode_frame(msg?)? {
                    Inbound::Server(m) if m.setup_complete.is_some() => return Ok(()),
                    Inbound::Closed(reason) => {
                        anyhow::bail!("Gemini Live closed during setup: {}", reason.unwrap_or_default())
                    }
                    _ => continue,
                }
            }
            anyhow::bail!("Gemini Live stream ended during setup")
        })
        .await
        .map_err(|_| anyhow::anyhow!("timed out waiting for Gemini Live setup"))??;

        info!(model = %self.config.model, mode = %mode, "Gemini Live session ready");

        let (queue, mut input_rx) = RealtimeInputQueue::new();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<anyhow::Result<AgentEvent>>();
        let input_rate = self.config.input_sample_rate;

        // Writer: realtime input until the queue closes, then a close frame
        tokio::spawn(async move {
            while let Some(blob) = input_rx.recv().await {
                let Some(msg) = realtime_input_message(&blob, input_rate) else {
                    trace!(mime_type = %blob.mime_type, "Unsupported realtime input, skipping");
                    continue;
                };
                if let Err(e) = ws_tx.send(Message::Text(msg.to_string().into())).await {
                    warn!(error = %e, "Gemini Live send failed");
                    return;
                }
            }
            let _ = ws_tx.send(Message::Close(None)).await;
            debug!("Gemini Live input closed");
        });

        // Reader: classify server content into events
        tokio::spawn(async move {
            while let Some(msg) = ws_rx.next().await {
                let inbound = msg
                    .map_err(anyhow::Error::from)
                    .and_then(decode_frame);
                let server = match inbound {
                    Ok(Inbound::Server(server)) => server,
                    Ok(Inbound::Closed(reason)) => {
                        debug!(reason = ?reason, "Gemini Live closed");
                        break;
                    }
                    Ok(Inbound::Skip) => continue,
                    Err(e) => {
                        let _ = event_tx.send(Err(e));
                        break;
                    }
                };

                if server.go_away.is_some() {
                    warn!("Gemini Live server sent goAway");
                }
                let Some(content) = server.server_content else {
                    continue;
                };
                match classify(content) {
                    Ok(events) => {
                        for event in events {
                            if event_tx.send(Ok(event)).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = event_tx.send(Err(e));
                        break;
                    }
                }
            }
        });

        Ok((queue, Box::pin(UnboundedReceiverStream::new(event_rx))))
    }
}
