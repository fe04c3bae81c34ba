//! Configuration loading and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::FrameFormat;

/// Top-level Live Bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub webrtc: Option<WebRtcConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<VideoConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    /// Upper bound on a single offer/answer exchange.
    #[serde(default = "default_negotiation_timeout_secs")]
    pub negotiation_timeout_secs: u64,

    /// Allow cross-origin requests to `/offer`.
    #[serde(default = "default_true")]
    pub cors: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: None,
            negotiation_timeout_secs: default_negotiation_timeout_secs(),
            cors: true,
        }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_negotiation_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

/// Peer connection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebRtcConfig {
    #[serde(default)]
    pub ice_servers: Vec<IceServerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Audio framing for both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Sample rate of agent-produced audio sent to the client.
    #[serde(default = "default_output_sample_rate")]
    pub output_sample_rate: u32,

    /// Duration of one outbound frame.
    #[serde(default = "default_frame_ms")]
    pub frame_ms: u32,

    /// How long a pull waits for agent audio before padding with silence.
    #[serde(default = "default_underrun_timeout_ms")]
    pub underrun_timeout_ms: u64,

    /// Sample rate the agent expects for inbound microphone audio.
    #[serde(default = "default_input_sample_rate")]
    pub input_sample_rate: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            output_sample_rate: default_output_sample_rate(),
            frame_ms: default_frame_ms(),
            underrun_timeout_ms: default_underrun_timeout_ms(),
            input_sample_rate: default_input_sample_rate(),
        }
    }
}

fn default_output_sample_rate() -> u32 {
    24_000
}

fn default_frame_ms() -> u32 {
    20
}

fn default_underrun_timeout_ms() -> u64 {
    100
}

fn default_input_sample_rate() -> u32 {
    16_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    /// JPEG quality (1-100) for stills forwarded to the agent.
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

fn default_jpeg_quality() -> u8 {
    75
}

/// Live agent backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// System instruction sent when the live session opens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,

    /// Prebuilt voice name for audio responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            provider: default_agent_provider(),
            model: None,
            api_key: None,
            api_key_env: None,
            base_url: None,
            instruction: None,
            voice: None,
        }
    }
}

fn default_agent_provider() -> String {
    "gemini".into()
}

impl AgentConfig {
    /// Resolve the API key: `api_key` first, then `api_key_env`, then `GOOGLE_API_KEY`.
    pub fn resolve_api_key(&self) -> Option<String> {
        let env = self
            .api_key_env
            .clone()
            .or_else(|| Some("GOOGLE_API_KEY".to_string()));
        resolve_secret_field(&self.api_key, &env)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "live_bridge_gateway=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> crate::error::Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| crate::error::BridgeError::Config(e.to_string()))?;
    Ok(re
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_default()
        })
        .into_owned())
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(crate::error::BridgeError::Io)?;
        Self::parse(&raw)
    }

    /// Parse config text (JSON5) after env substitution.
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let substituted = substitute_env_vars(raw)?;
        json5::from_str(&substituted).map_err(|e| crate::error::BridgeError::Config(e.to_string()))
    }

    /// Default config file path.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or_else(default_port)
    }

    pub fn gateway_bind(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    pub fn negotiation_timeout(&self) -> std::time::Duration {
        let secs = self
            .gateway
            .as_ref()
            .map(|g| g.negotiation_timeout_secs)
            .unwrap_or_else(default_negotiation_timeout_secs);
        std::time::Duration::from_secs(secs)
    }

    pub fn cors_enabled(&self) -> bool {
        self.gateway.as_ref().map(|g| g.cors).unwrap_or(true)
    }

    pub fn audio(&self) -> AudioConfig {
        self.audio.clone().unwrap_or_default()
    }

    pub fn video(&self) -> VideoConfig {
        self.video.clone().unwrap_or_default()
    }

    pub fn agent(&self) -> AgentConfig {
        self.agent.clone().unwrap_or_default()
    }

    /// Framing of agent audio sent back to the client.
    pub fn output_frame_format(&self) -> FrameFormat {
        let audio = self.audio();
        FrameFormat::new(audio.output_sample_rate, audio.frame_ms)
    }

    pub fn underrun_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.audio().underrun_timeout_ms)
    }

    /// ICE servers, falling back to Google's public STUN servers.
    pub fn ice_servers(&self) -> Vec<IceServerConfig> {
        match &self.webrtc {
            Some(w) if !w.ice_servers.is_empty() => w.ice_servers.clone(),
            _ => vec![IceServerConfig {
                urls: vec![
                    "stun:stun1.l.google.com:19302".into(),
                    "stun:stun2.l.google.com:19302".into(),
                ],
                username: None,
                credential: None,
            }],
        }
    }

    /// Get a config value by dotted path (e.g. "gateway.port", "audio.frame_ms").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        let agent = self.agent();
        if agent.resolve_api_key().is_none() {
            warnings.push(format!(
                "Agent provider '{}' has no API key configured",
                agent.provider
            ));
        }
        if agent.provider != "gemini" {
            errors.push(format!("Unknown agent provider: {}", agent.provider));
        }

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
        }

        let audio = self.audio();
        if audio.output_sample_rate == 0 || audio.input_sample_rate == 0 {
            errors.push("Audio sample rates must be non-zero".to_string());
        }
        if audio.frame_ms == 0 || 1000 % audio.frame_ms != 0 {
            errors.push(format!(
                "Audio frame_ms must evenly divide one second, got {}",
                audio.frame_ms
            ));
        }

        let quality = self.video().jpeg_quality;
        if quality == 0 || quality > 100 {
            errors.push(format!("Video jpeg_quality must be 1-100, got {quality}"));
        }

        (warnings, errors)
    }
}

/// Base directory for Live Bridge data: `~/.live_bridge/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".live_bridge")
}
