//! H.264 decoding for remote video tracks.
//!
//! RTP payloads are depacketized to Annex-B and buffered until the marker
//! bit closes the access unit, which is then handed to OpenH264.

use bytes::Bytes;
use openh264::decoder::Decoder;
use openh264::formats::YUVSource;
use tracing::{debug, trace};
use webrtc::api::media_engine::MIME_TYPE_H264;
use webrtc::rtp::codecs::h264::H264Packet;
use webrtc::rtp::packetizer::Depacketizer;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters};

use live_bridge_media::ingress::{PixelData, VideoFrame};

use crate::rtc::{VideoDecoder, VideoDecoderFactory};

/// Access units larger than this are dropped rather than buffered.
const MAX_ACCESS_UNIT: usize = 4 * 1024 * 1024;

pub struct H264Decoder {
    depacketizer: H264Packet,
    access_unit: Vec<u8>,
    decoder: Decoder,
}

impl H264Decoder {
    pub fn new() -> anyhow::Result<Self> {
        let decoder = Decoder::new().map_err(|e| anyhow::anyhow!("openh264: {e}"))?;
        Ok(Self {
            depacketizer: H264Packet::default(),
            access_unit: Vec::new(),
            decoder,
        })
    }
}

impl VideoDecoder for H264Decoder {
    fn decode(&mut self, payload: &[u8], marker: bool) -> anyhow::Result<Option<VideoFrame>> {
        match self.depacketizer.depacketize(&Bytes::copy_from_slice(payload)) {
            Ok(nal) => self.access_unit.extend_from_slice(&nal),
            Err(e) => {
                trace!(error = %e, "Dropping malformed H.264 payload");
                self.access_unit.clear();
                return Ok(None);
            }
        }
        if self.access_unit.len() > MAX_ACCESS_UNIT {
            debug!(bytes = self.access_unit.len(), "H.264 access unit too large, dropping");
            self.access_unit.clear();
            return Ok(None);
        }
        if !marker || self.access_unit.is_empty() {
            return Ok(None);
        }

        let access_unit = std::mem::take(&mut self.access_unit);
        match self.decoder.decode(&access_unit) {
            Ok(Some(yuv)) => {
                let (width, height) = yuv.dimensions();
                let mut rgb = vec![0u8; width * height * 3];
                yuv.write_rgb8(&mut rgb);
                Ok(Some(VideoFrame {
                    width: width as u32,
                    height: height as u32,
                    pixels: PixelData::Rgb24(rgb),
                }))
            }
            Ok(None) => Ok(None),
            // Missing references after loss; the next keyframe recovers
            Err(e) => {
                debug!(error = %e, "H.264 decode failed");
                Ok(None)
            }
        }
    }
}

/// Serves [`H264Decoder`]s and restricts negotiation to H.264.
#[derive(Debug, Default, Clone, Copy)]
pub struct H264DecoderFactory;

impl VideoDecoderFactory for H264DecoderFactory {
    fn create(&self, mime_type: &str) -> Option<Box<dyn VideoDecoder>> {
        if !mime_type.eq_ignore_ascii_case(MIME_TYPE_H264) {
            return None;
        }
        match H264Decoder::new() {
            Ok(decoder) => Some(Box::new(decoder)),
            Err(e) => {
                debug!(error = %e, "Failed to create H.264 decoder");
                None
            }
        }
    }

    fn codecs(&self) -> Vec<RTCRtpCodecParameters> {
        let feedback = vec![
            RTCPFeedback {
                typ: "goog-remb".to_owned(),
                parameter: String::new(),
            },
            RTCPFeedback {
                typ: "ccm".to_owned(),
                parameter: "fir".to_owned(),
            },
            RTCPFeedback {
                typ: "nack".to_owned(),
                parameter: String::new(),
            },
            RTCPFeedback {
                typ: "nack".to_owned(),
                parameter: "pli".to_owned(),
            },
        ];

        // Constrained baseline and baseline, packetization-mode 1
        [(102, "42001f"), (108, "42e01f")]
            .into_iter()
            .map(|(payload_type, profile)| RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_H264.to_owned(),
                    clock_rate: 90_000,
                    channels: 0,
                    sdp_fmtp_line: format!(
                        "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id={profile}"
                    ),
                    rtcp_feedback: feedback.clone(),
                },
                payload_type,
                ..Default::default()
            })
            .collect()
    }
}
