//! Peer transport seam and connection state tracking.
//!
//! The gateway talks to a peer connection only through these traits, so the
//! WebRTC stack can be swapped out (and faked in tests).

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use live_bridge_core::protocol::SessionDescription;
use live_bridge_media::{AudioPacer, InboundTrack};

/// Connection state as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Session-side view of the peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Negotiating,
    Connected,
    Failed,
    Closed,
}

impl PeerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

/// Outcome of feeding a transport state into the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// State changed; nothing else to do.
    Moved(PeerState),
    /// Entered a terminal state for the first time. The caller tears down.
    Teardown(PeerState),
    Ignored,
}

#[derive(Debug)]
pub struct PeerStateMachine {
    state: PeerState,
}

impl Default for PeerStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerStateMachine {
    pub fn new() -> Self {
        Self {
            state: PeerState::New,
        }
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Mark the offer/answer exchange as started.
    pub fn begin_negotiation(&mut self) -> Transition {
        if self.state == PeerState::New {
            self.state = PeerState::Negotiating;
            Transition::Moved(self.state)
        } else {
            Transition::Ignored
        }
    }

    /// Apply a transport report. Terminal states absorb everything, so
    /// [`Transition::Teardown`] is returned at most once.
    pub fn transition(&mut self, reported: TransportState) -> Transition {
        if self.state.is_terminal() {
            return Transition::Ignored;
        }

        let next = match reported {
            TransportState::New => return Transition::Ignored,
            TransportState::Connecting => PeerState::Negotiating,
            TransportState::Connected => PeerState::Connected,
            // ICE may recover from a transient disconnect
            TransportState::Disconnected => {
                debug!(state = ?self.state, "Transport disconnected, waiting for recovery");
                return Transition::Ignored;
            }
            TransportState::Failed => PeerState::Failed,
            TransportState::Closed => PeerState::Closed,
        };

        if next == self.state {
            return Transition::Ignored;
        }
        self.state = next;
        if next.is_terminal() {
            Transition::Teardown(next)
        } else {
            Transition::Moved(next)
        }
    }

    /// Force the terminal `Closed` state (explicit teardown).
    pub fn close(&mut self) {
        if !self.state.is_terminal() {
            self.state = PeerState::Closed;
        }
    }
}

/// Receives transport callbacks for one session.
pub trait TransportObserver: Send + Sync {
    fn on_state_change(&self, state: TransportState);

    fn on_track(&self, track: Box<dyn InboundTrack>);
}

/// A live peer connection.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Close the connection. Closing twice is a no-op.
    async fn close(&self) -> anyhow::Result<()>;
}

/// Builds peer connections from remote offers.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Apply `offer`, attach `pacer` as the outbound audio track and return
    /// the final local answer once ICE gathering is complete.
    async fn connect(
        &self,
        offer: SessionDescription,
        pacer: AudioPacer,
        observer: Arc<dyn TransportObserver>,
    ) -> anyhow::Result<(SessionDescription, Arc<dyn PeerTransport>)>;
}
