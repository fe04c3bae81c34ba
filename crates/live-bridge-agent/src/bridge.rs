//! Agent bridge: owns one live agent session and relays its output.
//!
//! Audio goes to the outbound pacer; control and text deltas go to the
//! client's signaling room. Input from ingress tasks is forwarded only while
//! the bridge is running.

use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use live_bridge_core::types::{RealtimeBlob, RealtimeSink, ResponseMode};
use live_bridge_media::PacerSink;
use live_bridge_media::resample::RateConverter;

use crate::event::{Route, route};
use crate::session::{AgentConnector, EventStream, RealtimeInputQueue, SignalingSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    Starting,
    Running,
    Closed,
}

struct BridgeInner {
    state: BridgeState,
    queue: Option<RealtimeInputQueue>,
    task: Option<JoinHandle<()>>,
}

pub struct AgentBridge {
    session_id: String,
    connector: Arc<dyn AgentConnector>,
    signaling: Arc<dyn SignalingSink>,
    pacer: PacerSink,
    cancel: CancellationToken,
    inner: Mutex<BridgeInner>,
}

impl AgentBridge {
    pub fn new(
        session_id: impl Into<String>,
        connector: Arc<dyn AgentConnector>,
        signaling: Arc<dyn SignalingSink>,
        pacer: PacerSink,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            connector,
            signaling,
            pacer,
            cancel: CancellationToken::new(),
            inner: Mutex::new(BridgeInner {
                state: BridgeState::Idle,
                queue: None,
                task: None,
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> BridgeState {
        self.inner.lock().state
    }

    /// Open the agent session and start relaying its output.
    ///
    /// Fails if the bridge was already started, if the connector fails, or if
    /// [`AgentBridge::close`] ran while the session was opening.
    pub async fn start(&self, mode: ResponseMode) -> anyhow::Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.state != BridgeState::Idle {
                anyhow::bail!("agent bridge already {:?}", inner.state);
            }
            inner.state = BridgeState::Starting;
        }

        info!(
            session_id = %self.session_id,
            agent = %self.connector.name(),
            mode = %mode,
            "Starting agent session"
        );

        let (queue, events) = match self.connector.open(mode).await {
            Ok(opened) => opened,
            Err(e) => {
                let mut inner = self.inner.lock();
                if inner.state == BridgeState::Starting {
                    inner.state = BridgeState::Closed;
                }
                return Err(e.context("failed to open agent session"));
            }
        };

        let mut inner = self.inner.lock();
        if inner.state == BridgeState::Closed {
            queue.close();
            anyhow::bail!("agent bridge closed while starting");
        }

        let task = tokio::spawn(run_event_loop(
            self.session_id.clone(),
            events,
            self.signaling.clone(),
            self.pacer.clone(),
            self.cancel.clone(),
        ));

        inner.state = BridgeState::Running;
        inner.queue = Some(queue);
        inner.task = Some(task);
        Ok(())
    }

    /// Stop the session. Safe to call any number of times, in any state.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.state == BridgeState::Closed {
            return;
        }
        inner.state = BridgeState::Closed;

        if let Some(queue) = inner.queue.take() {
            queue.close();
        }
        self.cancel.cancel();
        // The loop exits on cancellation; dropping the handle detaches it.
        inner.task.take();
        info!(session_id = %self.session_id, "Agent bridge closed");
    }

    pub fn is_running(&self) -> bool {
        self.state() == BridgeState::Running
    }
}

impl RealtimeSink for AgentBridge {
    fn send_realtime(&self, blob: RealtimeBlob) -> bool {
        let inner = self.inner.lock();
        match (&inner.state, &inner.queue) {
            (BridgeState::Running, Some(queue)) => queue.send(blob),
            _ => false,
        }
    }
}

impl Drop for AgentBridge {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_event_loop(
    session_id: String,
    mut events: EventStream,
    signaling: Arc<dyn SignalingSink>,
    pacer: PacerSink,
    cancel: CancellationToken,
) {
    debug!(session_id = %session_id, "Agent event loop started");
    let mut output = RateConverter::new(pacer.format().sample_rate);
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = events.next() => next,
        };

        let event = match next {
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                warn!(session_id = %session_id, error = %e, "Agent event stream failed");
                break;
            }
            None => {
                debug!(session_id = %session_id, "Agent event stream ended");
                break;
            }
        };

        let routed = route(event);
        #[cfg(feature = "metrics")]
        metrics::counter!("agent_events_total", "route" => routed.label()).increment(1);

        match routed {
            Route::Control(message) | Route::Text(message) => {
                if !signaling.emit(&session_id, &message) {
                    trace!(session_id = %session_id, "No signaling connection for message");
                }
            }
            Route::Audio(chunk) => match output.convert(&chunk) {
                Ok(data) => {
                    pacer.push(data);
                }
                Err(e) => {
                    warn!(
                        session_id = %session_id,
                        rate = chunk.sample_rate,
                        error = %e,
                        "Dropping agent audio that cannot be resampled"
                    );
                }
            },
            Route::Drop => {}
        }
    }
    debug!(session_id = %session_id, "Agent event loop finished");
}
