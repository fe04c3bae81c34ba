//! Agent session interface consumed by the bridge.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use live_bridge_core::protocol::SignalingMessage;
use live_bridge_core::types::{RealtimeBlob, ResponseMode};

use crate::event::AgentEvent;

/// Stream of classified agent output. An `Err` item ends the session.
pub type EventStream = Pin<Box<dyn Stream<Item = anyhow::Result<AgentEvent>> + Send>>;

/// Input side of a live agent session.
///
/// Cloning shares the same underlying queue. Closing it tells the connector
/// to end the session; further sends are rejected.
#[derive(Clone)]
pub struct RealtimeInputQueue {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<RealtimeBlob>>>>,
}

impl RealtimeInputQueue {
    /// Create a queue and the receiver a connector drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RealtimeBlob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    pub fn send(&self, blob: RealtimeBlob) -> bool {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(blob).is_ok(),
            None => false,
        }
    }

    /// Close the queue. Returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        self.tx.lock().take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().as_ref().is_none_or(|tx| tx.is_closed())
    }
}

/// Opens live agent sessions.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    async fn open(&self, mode: ResponseMode) -> anyhow::Result<(RealtimeInputQueue, EventStream)>;
}

/// Delivers messages to the client's signaling channel.
pub trait SignalingSink: Send + Sync {
    /// Address `message` to `room`. Returns whether a live connection took it.
    fn emit(&self, room: &str, message: &SignalingMessage) -> bool;
}
