//! Live bridge gateway.
//!
//! Hosts the HTTP offer endpoint and the WebSocket signaling channel, keeps a
//! registry of media sessions keyed by signaling connection, and wires each
//! session's peer transport, outbound pacer and agent bridge together.

pub mod connection;
pub mod events;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod offer;
pub mod rtc;
pub mod server;
pub mod session;
pub mod state;
pub mod transport;
pub mod video;

pub use rtc::{VideoDecoder, VideoDecoderFactory, WebRtcConnector};
pub use server::{build_router, serve, start_gateway};
pub use session::{Session, SessionRegistry};
pub use state::GatewayState;
pub use transport::{
    PeerConnector, PeerState, PeerStateMachine, PeerTransport, TransportObserver,
    TransportState,
};
pub use video::H264DecoderFactory;
