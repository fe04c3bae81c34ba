use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// MIME type of raw 16-bit little-endian PCM audio.
pub const MIME_AUDIO_PCM: &str = "audio/pcm";

/// MIME type of JPEG stills forwarded from video tracks.
pub const MIME_IMAGE_JPEG: &str = "image/jpeg";

/// MIME type of text deltas relayed to the client.
pub const MIME_TEXT_PLAIN: &str = "text/plain";

/// Bytes per sample of 16-bit signed PCM.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Rate of agent PCM output that does not declare one in its MIME type.
pub const DEFAULT_AGENT_OUTPUT_RATE: u32 = 24_000;

/// Extract the `rate=` parameter from a PCM MIME type such as
/// `audio/pcm;rate=24000`.
pub fn pcm_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.trim().parse().ok())
        .filter(|&rate| rate > 0)
}

/// Output modality requested from the agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    Audio,
    #[default]
    Text,
}

impl ResponseMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Text => "text",
        }
    }
}

impl fmt::Display for ResponseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResponseMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "audio" => Ok(Self::Audio),
            "text" => Ok(Self::Text),
            other => Err(format!("Unknown response mode: {other}")),
        }
    }
}

/// Raw mono PCM produced by the agent or by ingress resampling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub sample_rate: u32,
    pub channels: u16,
    pub data: Bytes,
}

impl AudioChunk {
    pub fn mono(sample_rate: u32, data: impl Into<Bytes>) -> Self {
        Self {
            sample_rate,
            channels: 1,
            data: data.into(),
        }
    }

    /// Wrap PCM tagged with `mime_type`, taking the rate from its `rate=`
    /// parameter or `default_rate` when absent.
    pub fn from_pcm_mime(mime_type: &str, data: impl Into<Bytes>, default_rate: u32) -> Self {
        Self::mono(pcm_rate(mime_type).unwrap_or(default_rate), data)
    }

    /// Number of whole 16-bit samples in the payload.
    pub fn sample_count(&self) -> usize {
        self.data.len() / BYTES_PER_SAMPLE
    }
}

/// A real-time input blob forwarded into the agent session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealtimeBlob {
    pub data: Bytes,
    pub mime_type: String,
}

impl RealtimeBlob {
    pub fn new(data: impl Into<Bytes>, mime_type: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }

    pub fn audio_pcm(data: impl Into<Bytes>) -> Self {
        Self::new(data, MIME_AUDIO_PCM)
    }

    pub fn jpeg(data: impl Into<Bytes>) -> Self {
        Self::new(data, MIME_IMAGE_JPEG)
    }
}

/// Anything that accepts real-time input blobs on behalf of an agent session.
///
/// Returns `false` when the blob was dropped because no live session is
/// attached.
pub trait RealtimeSink: Send + Sync {
    fn send_realtime(&self, blob: RealtimeBlob) -> bool;
}

/// Fixed framing parameters for 16-bit mono PCM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    pub sample_rate: u32,
    pub frame_ms: u32,
}

impl FrameFormat {
    pub fn new(sample_rate: u32, frame_ms: u32) -> Self {
        Self {
            sample_rate,
            frame_ms,
        }
    }

    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize) / 1000
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.samples_per_frame() * BYTES_PER_SAMPLE
    }

    pub fn frame_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.frame_ms as u64)
    }
}

impl Default for FrameFormat {
    fn default() -> Self {
        Self::new(24_000, 20)
    }
}
