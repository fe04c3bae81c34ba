//! Agent bridge: connects a live agent session to a media session.
//!
//! A connector opens the session and classifies its output into
//! [`AgentEvent`]s once, at the boundary. The [`AgentBridge`] routes those
//! events to the outbound pacer or the client's signaling room.

pub mod bridge;
pub mod event;
pub mod gemini;
pub mod session;

pub use bridge::{AgentBridge, BridgeState};
pub use event::{AgentEvent, ContentEvent, ContentPayload, Route, route};
pub use gemini::{GeminiLiveConfig, GeminiLiveConnector};
pub use session::{AgentConnector, EventStream, RealtimeInputQueue, SignalingSink};
