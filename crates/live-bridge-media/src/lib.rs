//! Media pipeline: outbound frame pacing, inbound track conversion, codecs.

pub mod codec;
pub mod frame_buffer;
pub mod ingress;
pub mod jpeg;
pub mod pacer;
pub mod resample;

pub use ingress::{InboundTrack, IngressSettings, MediaFrame, TrackKind, spawn_ingress};
pub use pacer::{AudioPacer, OutboundFrame, PacerSink};

/// Errors raised while converting or coding media.
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Resample error: {0}")]
    Resample(String),

    #[error("Image error: {0}")]
    Image(String),
}
