//! Opus encode/decode for the WebRTC audio path.

use audiopus::coder::{Decoder, Encoder};
use audiopus::packet::Packet;
use audiopus::{Application, Channels, MutSignals, SampleRate};

use crate::MediaError;

/// Largest encoded frame we allocate for.
const MAX_OPUS_FRAME_BYTES: usize = 4000;

/// 120ms at 48kHz, the longest frame Opus can produce.
const MAX_DECODED_SAMPLES: usize = 5760;

/// RTP clock rate for Opus is always 48kHz regardless of the coded rate.
pub const OPUS_CLOCK_RATE: u32 = 48_000;

fn sample_rate(rate: u32) -> Result<SampleRate, MediaError> {
    SampleRate::try_from(rate as i32)
        .map_err(|e| MediaError::Codec(format!("unsupported opus rate {rate}: {e}")))
}

/// Mono Opus encoder for outbound frames.
pub struct OpusEncoder {
    inner: Encoder,
    sample_rate: u32,
}

impl OpusEncoder {
    pub fn new(rate: u32) -> Result<Self, MediaError> {
        let inner = Encoder::new(sample_rate(rate)?, Channels::Mono, Application::Voip)
            .map_err(|e| MediaError::Codec(format!("failed to create opus encoder: {e}")))?;
        Ok(Self {
            inner,
            sample_rate: rate,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Encode one frame. The sample count must be a valid Opus frame size
    /// (2.5, 5, 10, 20, 40 or 60ms at the configured rate).
    pub fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, MediaError> {
        let mut out = vec![0u8; MAX_OPUS_FRAME_BYTES];
        let len = self
            .inner
            .encode(pcm, &mut out)
            .map_err(|e| MediaError::Codec(format!("opus encode failed: {e}")))?;
        out.truncate(len);
        Ok(out)
    }
}

/// Mono Opus decoder for inbound RTP payloads.
pub struct OpusDecoder {
    inner: Decoder,
    sample_rate: u32,
}

impl OpusDecoder {
    pub fn new(rate: u32) -> Result<Self, MediaError> {
        let inner = Decoder::new(sample_rate(rate)?, Channels::Mono)
            .map_err(|e| MediaError::Codec(format!("failed to create opus decoder: {e}")))?;
        Ok(Self {
            inner,
            sample_rate: rate,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn decode(&mut self, payload: &[u8]) -> Result<Vec<i16>, MediaError> {
        let mut out = vec![0i16; MAX_DECODED_SAMPLES];
        let packet = Packet::try_from(payload)
            .map_err(|e| MediaError::Codec(format!("invalid opus packet: {e}")))?;
        let signals = MutSignals::try_from(out.as_mut_slice())
            .map_err(|e| MediaError::Codec(format!("bad output buffer: {e}")))?;
        let decoded = self
            .inner
            .decode(Some(packet), signals, false)
            .map_err(|e| MediaError::Codec(format!("opus decode failed: {e}")))?;
        out.truncate(decoded);
        Ok(out)
    }
}
