//! Inbound media ingress: one task per remote track.
//!
//! Each task blocks on the next decoded frame, converts it to the agent's
//! input format and hands it to a [`RealtimeSink`]. A failing track is logged
//! and ends only its own task.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use live_bridge_core::types::{RealtimeBlob, RealtimeSink};

use crate::jpeg::encode_jpeg;
use crate::resample::{MonoResampler, downmix_to_mono, pcm_to_le_bytes};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

/// Raw pixel payload of a decoded video frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PixelData {
    /// Packed 8-bit RGB, `width * height * 3` bytes.
    Rgb24(Vec<u8>),
    /// Planar YUV 4:2:0.
    I420 { y: Vec<u8>, u: Vec<u8>, v: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub pixels: PixelData,
}

/// A decoded frame from a remote track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaFrame {
    Audio {
        /// Interleaved 16-bit samples.
        samples: Vec<i16>,
        sample_rate: u32,
        channels: u16,
    },
    Video(VideoFrame),
}

/// A remote media track delivering decoded frames.
#[async_trait]
pub trait InboundTrack: Send {
    fn kind(&self) -> TrackKind;

    fn id(&self) -> &str;

    /// Wait for the next frame. `Ok(None)` means the track ended.
    async fn receive(&mut self) -> anyhow::Result<Option<MediaFrame>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngressSettings {
    /// Sample rate the agent expects for input audio.
    pub input_sample_rate: u32,
    pub jpeg_quality: u8,
}

impl Default for IngressSettings {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            jpeg_quality: 75,
        }
    }
}

/// Counters reported when an ingress task finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngressReport {
    pub frames: u64,
    pub forwarded: u64,
    pub dropped: u64,
}

/// Converts frames of one kind into realtime blobs.
enum Converter {
    Audio {
        resampler: Option<MonoResampler>,
        target_rate: u32,
    },
    Video {
        quality: u8,
    },
}

impl Converter {
    fn for_kind(kind: TrackKind, settings: IngressSettings) -> Self {
        match kind {
            TrackKind::Audio => Self::Audio {
                resampler: None,
                target_rate: settings.input_sample_rate,
            },
            TrackKind::Video => Self::Video {
                quality: settings.jpeg_quality,
            },
        }
    }

    fn convert(&mut self, frame: MediaFrame) -> anyhow::Result<Option<RealtimeBlob>> {
        match (self, frame) {
            (
                Self::Audio {
                    resampler,
                    target_rate,
                },
                MediaFrame::Audio {
                    samples,
                    sample_rate,
                    channels,
                },
            ) => {
                let mono = downmix_to_mono(&samples, channels);

                // Rebuild the resampler if the source rate changes mid-stream
                let stale = resampler
                    .as_ref()
                    .is_none_or(|r| r.input_rate() != sample_rate);
                if stale {
                    *resampler = Some(MonoResampler::new(sample_rate, *target_rate)?);
                }
                let Some(r) = resampler.as_mut() else {
                    return Ok(None);
                };

                let out = r.process(&mono)?;
                if out.is_empty() {
                    return Ok(None);
                }
                Ok(Some(RealtimeBlob::audio_pcm(pcm_to_le_bytes(&out))))
            }
            (Self::Video { quality }, MediaFrame::Video(frame)) => {
                let jpeg = encode_jpeg(&frame, *quality)?;
                Ok(Some(RealtimeBlob::jpeg(jpeg)))
            }
            _ => {
                trace!("Frame kind does not match track kind, skipping");
                Ok(None)
            }
        }
    }
}

/// Drive one track until it ends, fails, or `cancel` fires.
pub async fn run_ingress(
    mut track: Box<dyn InboundTrack>,
    sink: Arc<dyn RealtimeSink>,
    settings: IngressSettings,
    cancel: CancellationToken,
) -> anyhow::Result<IngressReport> {
    let kind = track.kind();
    let mut converter = Converter::for_kind(kind, settings);
    let mut report = IngressReport::default();

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = track.receive() => frame?,
        };
        let Some(frame) = frame else {
            debug!(track = %track.id(), %kind, "Track ended");
            break;
        };
        report.frames += 1;

        let Some(blob) = converter.convert(frame)? else {
            continue;
        };
        if sink.send_realtime(blob) {
            report.forwarded += 1;
        } else {
            report.dropped += 1;
        }
        #[cfg(feature = "metrics")]
        metrics::counter!("ingress_frames_total", "kind" => kind.to_string()).increment(1);
    }

    Ok(report)
}

/// Spawn an ingress task for `track`. Errors are logged, never propagated.
pub fn spawn_ingress(
    track: Box<dyn InboundTrack>,
    sink: Arc<dyn RealtimeSink>,
    settings: IngressSettings,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let kind = track.kind();
    let id = track.id().to_string();
    tokio::spawn(async move {
        info!(track = %id, %kind, "Ingress started");
        match run_ingress(track, sink, settings, cancel).await {
            Ok(report) => info!(
                track = %id,
                %kind,
                frames = report.frames,
                forwarded = report.forwarded,
                dropped = report.dropped,
                "Ingress finished"
            ),
            Err(e) => warn!(track = %id, %kind, error = %e, "Ingress failed"),
        }
    })
}
