//! webrtc-rs implementation of [`PeerConnector`].
//!
//! Each offer gets its own `RTCPeerConnection` with one outbound Opus track
//! fed by the session's [`AudioPacer`]. Remote tracks are decoded here and
//! handed to the observer as [`InboundTrack`]s.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MediaEngine};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtcp::packet::Packet as RtcpPacket;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use live_bridge_core::config::IceServerConfig;
use live_bridge_core::protocol::SessionDescription;
use live_bridge_media::codec::{OPUS_CLOCK_RATE, OpusDecoder, OpusEncoder};
use live_bridge_media::ingress::VideoFrame;
use live_bridge_media::{AudioPacer, InboundTrack, MediaFrame, TrackKind};

use crate::transport::{PeerConnector, PeerTransport, TransportObserver, TransportState};

/// Depacketizes and decodes one remote video codec.
pub trait VideoDecoder: Send {
    /// Feed one RTP payload. `marker` flags the last packet of a frame.
    fn decode(&mut self, payload: &[u8], marker: bool) -> anyhow::Result<Option<VideoFrame>>;
}

/// Creates decoders for remote video tracks.
pub trait VideoDecoderFactory: Send + Sync {
    /// Return a decoder for `mime_type`, or `None` if it is unsupported.
    fn create(&self, mime_type: &str) -> Option<Box<dyn VideoDecoder>>;

    /// Video codecs to offer in answers. Empty keeps the webrtc-rs defaults.
    fn codecs(&self) -> Vec<RTCRtpCodecParameters> {
        Vec::new()
    }
}

/// How often a keyframe is requested on decoded video tracks.
const KEYFRAME_INTERVAL: Duration = Duration::from_secs(3);

pub struct WebRtcConnector {
    ice_servers: Vec<RTCIceServer>,
    video_decoders: Option<Arc<dyn VideoDecoderFactory>>,
}

impl WebRtcConnector {
    pub fn new(ice_servers: &[IceServerConfig]) -> Self {
        Self {
            ice_servers: ice_servers.iter().map(rtc_ice_server).collect(),
            video_decoders: None,
        }
    }

    pub fn with_video_decoders(mut self, factory: Arc<dyn VideoDecoderFactory>) -> Self {
        self.video_decoders = Some(factory);
        self
    }

    async fn new_peer_connection(&self) -> anyhow::Result<Arc<RTCPeerConnection>> {
        let mut media_engine = MediaEngine::default();
        let video_codecs = self
            .video_decoders
            .as_ref()
            .map(|f| f.codecs())
            .unwrap_or_default();
        if video_codecs.is_empty() {
            media_engine.register_default_codecs()?;
        } else {
            media_engine.register_codec(opus_codec(), RTPCodecType::Audio)?;
            for codec in video_codecs {
                media_engine.register_codec(codec, RTPCodecType::Video)?;
            }
        }

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        Ok(Arc::new(api.new_peer_connection(config).await?))
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(
        &self,
        offer: SessionDescription,
        pacer: AudioPacer,
        observer: Arc<dyn TransportObserver>,
    ) -> anyhow::Result<(SessionDescription, Arc<dyn PeerTransport>)> {
        let pc = self.new_peer_connection().await?;
        let cancel = CancellationToken::new();
        let guard = NegotiationGuard::new(Arc::new(WebRtcTransport {
            pc: pc.clone(),
            cancel: cancel.clone(),
        }));

        // Dropping `guard` before it is disarmed closes the peer
        let answer =
            negotiate(&pc, offer, pacer, observer, self.video_decoders.clone(), cancel).await?;
        Ok((answer, guard.disarm()))
    }
}

/// Closes a half-negotiated peer connection unless disarmed.
struct NegotiationGuard {
    transport: Arc<WebRtcTransport>,
    armed: bool,
}

impl NegotiationGuard {
    fn new(transport: Arc<WebRtcTransport>) -> Self {
        Self {
            transport,
            armed: true,
        }
    }

    fn disarm(mut self) -> Arc<dyn PeerTransport> {
        self.armed = false;
        self.transport.clone()
    }
}

impl Drop for NegotiationGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        debug!("Negotiation abandoned, closing peer connection");
        let transport = self.transport.clone();
        transport.cancel.cancel();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = transport.pc.close().await {
                        debug!(error = %e, "Failed to close abandoned peer connection");
                    }
                });
            }
            Err(_) => warn!("No runtime to close abandoned peer connection"),
        }
    }
}

fn opus_codec() -> RTCRtpCodecParameters {
    RTCRtpCodecParameters {
        capability: opus_capability(),
        payload_type: 111,
        ..Default::default()
    }
}

fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_owned(),
        clock_rate: OPUS_CLOCK_RATE,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
        rtcp_feedback: Vec::new(),
    }
}

async fn negotiate(
    pc: &Arc<RTCPeerConnection>,
    offer: SessionDescription,
    pacer: AudioPacer,
    observer: Arc<dyn TransportObserver>,
    video_decoders: Option<Arc<dyn VideoDecoderFactory>>,
    cancel: CancellationToken,
) -> anyhow::Result<SessionDescription> {
    // Callbacks hold the observer weakly; the session owns the transport
    let weak_observer: Weak<dyn TransportObserver> = Arc::downgrade(&observer);
    drop(observer);

    let state_observer = weak_observer.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        if let (Some(mapped), Some(observer)) = (map_state(state), state_observer.upgrade()) {
            observer.on_state_change(mapped);
        }
        Box::pin(async {})
    }));

    let track_observer = weak_observer;
    let track_pc = Arc::downgrade(pc);
    let track_cancel = cancel.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        if let Some(observer) = track_observer.upgrade() {
            let ssrc = track.ssrc();
            if let Some(inbound) = inbound_track(track, video_decoders.as_deref()) {
                if inbound.decodes_video {
                    tokio::spawn(request_keyframes(
                        track_pc.clone(),
                        ssrc,
                        track_cancel.child_token(),
                    ));
                }
                observer.on_track(Box::new(inbound));
            }
        }
        Box::pin(async {})
    }));

    let format = pacer.format();
    let outbound = Arc::new(TrackLocalStaticSample::new(
        opus_capability(),
        "audio".to_owned(),
        "live-bridge".to_owned(),
    ));
    let sender = pc
        .add_track(Arc::clone(&outbound) as Arc<dyn TrackLocal + Send + Sync>)
        .await?;

    // Interceptors only run while RTCP is being read
    let rtcp_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        loop {
            tokio::select! {
                _ = rtcp_cancel.cancelled() => break,
                res = sender.read(&mut buf) => {
                    if res.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let encoder = OpusEncoder::new(format.sample_rate).context("failed to create Opus encoder")?;
    tokio::spawn(drive_outbound(outbound, pacer, encoder, cancel));

    let offer = RTCSessionDescription::offer(offer.sdp).context("invalid offer SDP")?;
    pc.set_remote_description(offer)
        .await
        .context("failed to apply remote offer")?;
    let answer = pc.create_answer(None).await.context("failed to create answer")?;

    let mut gather_complete = pc.gathering_complete_promise().await;
    pc.set_local_description(answer).await?;
    let _ = gather_complete.recv().await;

    let local = pc
        .local_description()
        .await
        .ok_or_else(|| anyhow::anyhow!("no local description after gathering"))?;
    Ok(SessionDescription::answer(local.sdp))
}

/// Frame counts for the outbound send loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Cadence {
    frames: u64,
    /// Frames whose pull outlasted the frame period.
    late: u64,
}

impl Cadence {
    fn record(&mut self, waited: Duration, period: Duration) -> bool {
        self.frames += 1;
        let late = waited > period;
        if late {
            self.late += 1;
        }
        late
    }
}

/// Pull one paced frame per frame interval, encode and write it out.
///
/// While the agent is silent each pull waits out the underrun timeout, so
/// frames leave once per timeout rather than once per period. Those frames
/// are counted as late.
async fn drive_outbound(
    track: Arc<TrackLocalStaticSample>,
    mut pacer: AudioPacer,
    mut encoder: OpusEncoder,
    cancel: CancellationToken,
) {
    let duration = pacer.format().frame_duration();
    let mut ticker = tokio::time::interval(duration);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cadence = Cadence::default();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let started = Instant::now();
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = pacer.pull() => frame,
        };
        let Some(frame) = frame else {
            break;
        };
        if cadence.record(started.elapsed(), duration) {
            trace!(pts = frame.pts, "Outbound frame late");
            #[cfg(feature = "metrics")]
            crate::metrics::record_late_frame();
        }

        let packet = match encoder.encode(&frame.samples()) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(pts = frame.pts, error = %e, "Opus encode failed, skipping frame");
                continue;
            }
        };
        let sample = Sample {
            data: Bytes::from(packet),
            duration,
            ..Default::default()
        };
        if let Err(e) = track.write_sample(&sample).await {
            trace!(error = %e, "Outbound write failed");
        }
    }

    let stats = pacer.stats();
    debug!(
        frames = stats.frames_pulled,
        silence = stats.silence_frames,
        late = cadence.late,
        "Outbound audio stopped"
    );
}

/// Ask the sender for a keyframe now and then so a decoder that joined late
/// or lost packets can resynchronize.
async fn request_keyframes(pc: Weak<RTCPeerConnection>, media_ssrc: u32, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(KEYFRAME_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(pc) = pc.upgrade() else {
            break;
        };
        let pli: [Box<dyn RtcpPacket + Send + Sync>; 1] = [Box::new(PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc,
        })];
        if let Err(e) = pc.write_rtcp(&pli).await {
            trace!(ssrc = media_ssrc, error = %e, "Keyframe request failed");
            break;
        }
    }
}

fn inbound_track(
    track: Arc<TrackRemote>,
    video_decoders: Option<&dyn VideoDecoderFactory>,
) -> Option<RtpTrack> {
    let mime_type = track.codec().capability.mime_type;
    let id = track.id();
    match track.kind() {
        RTPCodecType::Audio => {
            if !mime_type.eq_ignore_ascii_case(MIME_TYPE_OPUS) {
                warn!(track = %id, mime_type = %mime_type, "Unsupported audio codec, draining");
                return Some(RtpTrack::drain(track, id, TrackKind::Audio));
            }
            match OpusDecoder::new(OPUS_CLOCK_RATE) {
                Ok(decoder) => Some(RtpTrack::new(
                    track,
                    id,
                    TrackKind::Audio,
                    PacketDecoder::Opus(decoder),
                )),
                Err(e) => {
                    warn!(track = %id, error = %e, "Failed to create Opus decoder");
                    None
                }
            }
        }
        RTPCodecType::Video => {
            let decoder = video_decoders.and_then(|f| f.create(&mime_type));
            Some(match decoder {
                Some(decoder) => {
                    RtpTrack::new(track, id, TrackKind::Video, PacketDecoder::Video(decoder))
                }
                None => {
                    info!(track = %id, mime_type = %mime_type, "No video decoder, draining");
                    RtpTrack::drain(track, id, TrackKind::Video)
                }
            })
        }
        RTPCodecType::Unspecified => None,
    }
}

/// Turns RTP payloads of one track into media frames.
enum PacketDecoder {
    Opus(OpusDecoder),
    Video(Box<dyn VideoDecoder>),
    /// Read and discard packets so the receiver keeps flowing.
    Drain,
}

impl PacketDecoder {
    /// Feed one payload. Audio decode errors are skipped; video decoders
    /// decide for themselves which errors end the track.
    fn feed(&mut self, payload: &[u8], marker: bool) -> anyhow::Result<Option<MediaFrame>> {
        match self {
            Self::Opus(decoder) => match decoder.decode(payload) {
                Ok(samples) if !samples.is_empty() => Ok(Some(MediaFrame::Audio {
                    samples,
                    sample_rate: OPUS_CLOCK_RATE,
                    channels: 1,
                })),
                Ok(_) => Ok(None),
                Err(e) => {
                    trace!(error = %e, "Opus decode error");
                    Ok(None)
                }
            },
            Self::Video(decoder) => Ok(decoder.decode(payload, marker)?.map(MediaFrame::Video)),
            Self::Drain => Ok(None),
        }
    }
}

struct RtpTrack {
    track: Arc<TrackRemote>,
    id: String,
    kind: TrackKind,
    decoder: PacketDecoder,
    decodes_video: bool,
}

impl RtpTrack {
    fn new(track: Arc<TrackRemote>, id: String, kind: TrackKind, decoder: PacketDecoder) -> Self {
        let decodes_video = matches!(decoder, PacketDecoder::Video(_));
        Self {
            track,
            id,
            kind,
            decoder,
            decodes_video,
        }
    }

    fn drain(track: Arc<TrackRemote>, id: String, kind: TrackKind) -> Self {
        Self::new(track, id, kind, PacketDecoder::Drain)
    }
}

#[async_trait]
impl InboundTrack for RtpTrack {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn id(&self) -> &str {
        &self.id
    }

    async fn receive(&mut self) -> anyhow::Result<Option<MediaFrame>> {
        loop {
            let packet = match self.track.read_rtp().await {
                Ok((packet, _)) => packet,
                Err(e) => {
                    debug!(track = %self.id, error = %e, "Track read ended");
                    return Ok(None);
                }
            };
            if packet.payload.is_empty() {
                continue;
            }

            if let Some(frame) = self.decoder.feed(&packet.payload, packet.header.marker)? {
                return Ok(Some(frame));
            }
        }
    }
}

/// A live webrtc-rs peer connection.
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    cancel: CancellationToken,
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn close(&self) -> anyhow::Result<()> {
        self.cancel.cancel();
        self.pc.close().await?;
        Ok(())
    }
}

fn map_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    match state {
        RTCPeerConnectionState::New => Some(TransportState::New),
        RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn rtc_ice_server(server: &IceServerConfig) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}
