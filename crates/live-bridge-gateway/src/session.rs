//! Media sessions and the session registry.
//!
//! A session ties one signaling room to one peer connection, one outbound
//! pacer and one agent bridge. Teardown can be triggered from the signaling
//! disconnect path, a transport failure callback, a renegotiation or
//! shutdown; it runs once no matter how many of those fire.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use live_bridge_agent::AgentBridge;
use live_bridge_core::types::{RealtimeBlob, RealtimeSink};
use live_bridge_media::{InboundTrack, IngressSettings, PacerSink, spawn_ingress};

use crate::transport::{
    PeerState, PeerStateMachine, PeerTransport, Transition, TransportObserver, TransportState,
};

pub struct Session {
    id: String,
    weak_self: Weak<Session>,
    registry: Weak<SessionRegistry>,
    peer: Mutex<PeerStateMachine>,
    pacer: Mutex<Option<PacerSink>>,
    bridge: Mutex<Option<Arc<AgentBridge>>>,
    transport: Mutex<Option<Arc<dyn PeerTransport>>>,
    ingress_settings: IngressSettings,
    ingress_cancel: CancellationToken,
    torn_down: AtomicBool,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        pacer: PacerSink,
        ingress_settings: IngressSettings,
        registry: &Arc<SessionRegistry>,
    ) -> Arc<Self> {
        let id = id.into();
        #[cfg(feature = "metrics")]
        crate::metrics::record_session_start();
        Arc::new_cyclic(|weak_self| Self {
            id,
            weak_self: weak_self.clone(),
            registry: Arc::downgrade(registry),
            peer: Mutex::new(PeerStateMachine::new()),
            pacer: Mutex::new(Some(pacer)),
            bridge: Mutex::new(None),
            transport: Mutex::new(None),
            ingress_settings,
            ingress_cancel: CancellationToken::new(),
            torn_down: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer_state(&self) -> PeerState {
        self.peer.lock().state()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    pub fn bridge(&self) -> Option<Arc<AgentBridge>> {
        self.bridge.lock().clone()
    }

    pub fn begin_negotiation(&self) {
        self.peer.lock().begin_negotiation();
    }

    /// Store the transport. Returns `false` (and closes it) if the session
    /// was torn down while negotiating.
    pub fn attach_transport(&self, transport: Arc<dyn PeerTransport>) -> bool {
        {
            let mut slot = self.transport.lock();
            if !self.is_torn_down() {
                *slot = Some(transport);
                return true;
            }
        }
        close_transport(&self.id, transport);
        false
    }

    /// Store the agent bridge. Returns `false` (and closes it) if the session
    /// was torn down in the meantime.
    pub fn attach_bridge(&self, bridge: Arc<AgentBridge>) -> bool {
        {
            let mut slot = self.bridge.lock();
            if !self.is_torn_down() {
                *slot = Some(bridge);
                return true;
            }
        }
        bridge.close();
        false
    }

    /// Release everything this session owns. Idempotent.
    pub fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(session_id = %self.id, "Tearing down session");

        self.peer.lock().close();

        if let Some(bridge) = self.bridge.lock().take() {
            bridge.close();
        }
        if let Some(pacer) = self.pacer.lock().take() {
            pacer.close();
        }
        self.ingress_cancel.cancel();

        if let Some(transport) = self.transport.lock().take() {
            close_transport(&self.id, transport);
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.remove_if_same(&self.id, self);
        }

        #[cfg(feature = "metrics")]
        crate::metrics::record_session_end();
    }
}

fn close_transport(session_id: &str, transport: Arc<dyn PeerTransport>) {
    let session_id = session_id.to_string();
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(e) = transport.close().await {
                    warn!(session_id = %session_id, error = %e, "Failed to close peer transport");
                }
            });
        }
        Err(_) => warn!(session_id = %session_id, "No runtime to close peer transport"),
    }
}

impl RealtimeSink for Session {
    /// Forward to whatever bridge is current. Tracks can start before the
    /// bridge exists, so this is looked up on every call.
    fn send_realtime(&self, blob: RealtimeBlob) -> bool {
        match self.bridge() {
            Some(bridge) => bridge.send_realtime(blob),
            None => false,
        }
    }
}

impl TransportObserver for Session {
    fn on_state_change(&self, state: TransportState) {
        let transition = self.peer.lock().transition(state);
        debug!(session_id = %self.id, ?state, ?transition, "Transport state change");
        if let Transition::Teardown(terminal) = transition {
            info!(session_id = %self.id, state = ?terminal, "Peer connection ended");
            self.teardown();
        }
    }

    fn on_track(&self, track: Box<dyn InboundTrack>) {
        if self.is_torn_down() {
            debug!(session_id = %self.id, "Ignoring track on torn down session");
            return;
        }
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        info!(session_id = %self.id, kind = %track.kind(), track = %track.id(), "Inbound track");
        spawn_ingress(
            track,
            this,
            self.ingress_settings,
            self.ingress_cancel.child_token(),
        );
    }
}

/// Sessions keyed by session id (the signaling room).
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `session`, returning whatever it replaced.
    pub fn insert(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        self.sessions
            .write()
            .insert(session.id().to_string(), session)
    }

    /// Register `session` and tear down any other session it displaces.
    pub fn register(&self, session: Arc<Session>) {
        if let Some(previous) = self.insert(session.clone()) {
            if !Arc::ptr_eq(&previous, &session) {
                info!(session_id = %previous.id(), "Displacing session with same id");
                previous.teardown();
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.write().remove(id)
    }

    /// Remove `id` only if it still maps to `session`, so a stale teardown
    /// cannot evict a newer session under the same id.
    pub fn remove_if_same(&self, id: &str, session: &Session) -> bool {
        let mut sessions = self.sessions.write();
        let same = sessions
            .get(id)
            .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), session));
        if same {
            sessions.remove(id);
        }
        same
    }

    pub fn drain(&self) -> Vec<Arc<Session>> {
        self.sessions.write().drain().map(|(_, s)| s).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
