//! Gateway integration tests: start a real gateway and interact via WS + HTTP.
//!
//! Run with: `cargo test -p live-bridge-gateway --test integration`

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{Notify, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use live_bridge_agent::{AgentConnector, AgentEvent, EventStream, RealtimeInputQueue};
use live_bridge_core::config::{AudioConfig, Config, GatewayConfig};
use live_bridge_core::protocol::SessionDescription;
use live_bridge_core::types::{RealtimeBlob, ResponseMode};
use live_bridge_gateway::{
    GatewayState, PeerConnector, PeerTransport, TransportObserver, TransportState,
};
use live_bridge_media::{AudioPacer, InboundTrack, MediaFrame, TrackKind};

/// An agent session opened by [`ScriptedAgent`].
struct AgentHandle {
    input: mpsc::UnboundedReceiver<RealtimeBlob>,
    events: mpsc::UnboundedSender<anyhow::Result<AgentEvent>>,
}

#[derive(Default)]
struct ScriptedAgent {
    opened: Mutex<Vec<AgentHandle>>,
}

impl ScriptedAgent {
    fn take(&self, index: usize) -> AgentHandle {
        self.opened.lock().remove(index)
    }
}

#[async_trait]
impl AgentConnector for ScriptedAgent {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn open(&self, _mode: ResponseMode) -> anyhow::Result<(RealtimeInputQueue, EventStream)> {
        let (queue, input) = RealtimeInputQueue::new();
        let (events, rx) = mpsc::unbounded_channel();
        self.opened.lock().push(AgentHandle { input, events });
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok((queue, Box::pin(stream)))
    }
}

#[derive(Default)]
struct FakeTransport {
    closes: AtomicUsize,
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn close(&self) -> anyhow::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakePeer {
    pacer: AudioPacer,
    observer: Arc<dyn TransportObserver>,
    transport: Arc<FakeTransport>,
}

/// Accepts every offer without touching the network.
#[derive(Default)]
struct FakePeers {
    peers: Mutex<Vec<FakePeer>>,
}

impl FakePeers {
    fn take(&self, index: usize) -> FakePeer {
        self.peers.lock().remove(index)
    }
}

#[async_trait]
impl PeerConnector for FakePeers {
    async fn connect(
        &self,
        _offer: SessionDescription,
        pacer: AudioPacer,
        observer: Arc<dyn TransportObserver>,
    ) -> anyhow::Result<(SessionDescription, Arc<dyn PeerTransport>)> {
        let transport = Arc::new(FakeTransport::default());
        self.peers.lock().push(FakePeer {
            pacer,
            observer,
            transport: transport.clone(),
        });
        Ok((SessionDescription::answer("v=0 fake"), transport))
    }
}

/// Fails every negotiation.
struct FailingPeers;

#[async_trait]
impl PeerConnector for FailingPeers {
    async fn connect(
        &self,
        _offer: SessionDescription,
        _pacer: AudioPacer,
        _observer: Arc<dyn TransportObserver>,
    ) -> anyhow::Result<(SessionDescription, Arc<dyn PeerTransport>)> {
        anyhow::bail!("ICE gathering failed")
    }
}

/// Never finishes negotiating. Keeps the pacer so the test can see it close.
#[derive(Default)]
struct HangingPeers {
    pacers: Mutex<Vec<AudioPacer>>,
}

#[async_trait]
impl PeerConnector for HangingPeers {
    async fn connect(
        &self,
        _offer: SessionDescription,
        pacer: AudioPacer,
        _observer: Arc<dyn TransportObserver>,
    ) -> anyhow::Result<(SessionDescription, Arc<dyn PeerTransport>)> {
        self.pacers.lock().push(pacer);
        std::future::pending().await
    }
}

/// Holds the first negotiation until released; later ones go straight through.
#[derive(Default)]
struct GatedPeers {
    inner: FakePeers,
    held: AtomicUsize,
    release: Notify,
}

#[async_trait]
impl PeerConnector for GatedPeers {
    async fn connect(
        &self,
        offer: SessionDescription,
        pacer: AudioPacer,
        observer: Arc<dyn TransportObserver>,
    ) -> anyhow::Result<(SessionDescription, Arc<dyn PeerTransport>)> {
        if self.held.fetch_add(1, Ordering::SeqCst) == 0 {
            self.release.notified().await;
        }
        self.inner.connect(offer, pacer, observer).await
    }
}

/// Yields one audio frame, then ends.
struct OneShotTrack {
    frame: Option<MediaFrame>,
}

#[async_trait]
impl InboundTrack for OneShotTrack {
    fn kind(&self) -> TrackKind {
        TrackKind::Audio
    }

    fn id(&self) -> &str {
        "mic"
    }

    async fn receive(&mut self) -> anyhow::Result<Option<MediaFrame>> {
        Ok(self.frame.take())
    }
}

/// Find an available port.
fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

struct TestGateway<P = FakePeers> {
    state: Arc<GatewayState>,
    agent: Arc<ScriptedAgent>,
    peers: Arc<P>,
    port: u16,
}

impl<P> TestGateway<P> {
    fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.port)
    }

    fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}/ws", self.port)
    }
}

/// Build a gateway with fake peers and a scripted agent.
async fn start_test_gateway() -> TestGateway {
    start_test_gateway_with(Config::default(), Arc::new(FakePeers::default())).await
}

async fn start_test_gateway_with<P: PeerConnector + 'static>(
    config: Config,
    peers: Arc<P>,
) -> TestGateway<P> {
    let port = find_free_port();
    let agent = Arc::new(ScriptedAgent::default());

    let state = Arc::new(GatewayState::new(
        Arc::new(config),
        agent.clone(),
        peers.clone(),
    ));

    // Start gateway in background
    let state_clone = state.clone();
    tokio::spawn(async move {
        let _ = live_bridge_gateway::serve(state_clone, port, std::future::pending()).await;
    });

    // Wait for gateway to be ready
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if reqwest::get(format!("http://127.0.0.1:{port}/health"))
            .await
            .is_ok()
        {
            break;
        }
    }

    TestGateway {
        state,
        agent,
        peers,
        port,
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn next_event(ws: &mut WsStream) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for event")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Connect a signaling socket and return it with its session id.
async fn connect_signaling<P>(gw: &TestGateway<P>) -> (WsStream, String) {
    let (mut ws, _) = connect_async(gw.ws_url()).await.unwrap();
    let hello = next_event(&mut ws).await;
    assert_eq!(hello["type"], "event");
    assert_eq!(hello["event"], "hello");
    let session_id = hello["payload"]["sessionId"].as_str().unwrap().to_string();
    (ws, session_id)
}

async fn post_offer<P>(gw: &TestGateway<P>, body: Value) -> reqwest::Response {
    reqwest::Client::new()
        .post(gw.url("/offer"))
        .json(&body)
        .send()
        .await
        .unwrap()
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_health_endpoint() {
    let gw = start_test_gateway().await;

    let resp = reqwest::get(gw.url("/health")).await.unwrap();
    assert_eq!(resp.status(), 200);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["sessions"], 0);
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_ws_hello_carries_session_id() {
    let gw = start_test_gateway().await;
    let (_ws, session_id) = connect_signaling(&gw).await;

    assert!(!session_id.is_empty());
    wait_until(|| gw.state.connections.contains(&session_id)).await;
}

#[tokio::test]
async fn test_offer_requires_session_id() {
    let gw = start_test_gateway().await;

    let resp = post_offer(&gw, json!({ "sdp": "v=0", "type": "offer" })).await;
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("sessionId"));
}

#[tokio::test]
async fn test_offer_unknown_session() {
    let gw = start_test_gateway().await;

    let resp = post_offer(
        &gw,
        json!({ "sdp": "v=0", "type": "offer", "sessionId": "nobody" }),
    )
    .await;
    assert_eq!(resp.status(), 404);
    assert!(gw.state.sessions.is_empty());
    assert!(gw.agent.opened.lock().is_empty());
}

#[tokio::test]
async fn test_offer_rejects_answer_type() {
    let gw = start_test_gateway().await;
    let (_ws, session_id) = connect_signaling(&gw).await;

    let resp = post_offer(
        &gw,
        json!({ "sdp": "v=0", "type": "answer", "sessionId": session_id }),
    )
    .await;
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_full_flow_relays_agent_output() {
    let gw = start_test_gateway().await;
    let (mut ws, session_id) = connect_signaling(&gw).await;

    let resp = post_offer(
        &gw,
        json!({
            "sdp": "v=0 offer",
            "type": "offer",
            "responseType": "audio",
            "sessionId": session_id,
        }),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let answer: Value = resp.json().await.unwrap();
    assert_eq!(answer["type"], "answer");
    assert_eq!(answer["sdp"], "v=0 fake");
    assert_eq!(gw.state.sessions.len(), 1);

    let agent = gw.agent.take(0);
    let mut peer = gw.peers.take(0);

    agent.events.send(Ok(AgentEvent::text("Hel", true))).unwrap();
    agent.events.send(Ok(AgentEvent::text("lo", true))).unwrap();
    agent.events.send(Ok(AgentEvent::text("Hello", false))).unwrap();
    agent.events.send(Ok(AgentEvent::control(true, false))).unwrap();

    let first = next_event(&mut ws).await;
    assert_eq!(first["event"], "message");
    assert_eq!(first["payload"]["data"], "Hel");
    let second = next_event(&mut ws).await;
    assert_eq!(second["payload"]["data"], "lo");
    let control = next_event(&mut ws).await;
    assert_eq!(control["payload"]["turn_complete"], true);
    assert_eq!(control["payload"]["interrupted"], false);

    // One frame of agent audio comes out of the pacer intact
    let format = peer.pacer.format();
    let pcm = vec![7u8; format.bytes_per_frame()];
    agent
        .events
        .send(Ok(AgentEvent::binary("audio/pcm;rate=24000", pcm.clone())))
        .unwrap();

    let mut delivered = None;
    for _ in 0..20 {
        let frame = peer.pacer.pull().await.unwrap();
        if frame.data.iter().any(|&b| b != 0) {
            delivered = Some(frame);
            break;
        }
    }
    let frame = delivered.expect("agent audio never reached the pacer");
    assert_eq!(frame.data.as_ref(), pcm.as_slice());
    assert_eq!(frame.sample_rate, format.sample_rate);
}

#[tokio::test]
async fn test_ws_disconnect_tears_down_session() {
    let gw = start_test_gateway().await;
    let (mut ws, session_id) = connect_signaling(&gw).await;

    let resp = post_offer(
        &gw,
        json!({ "sdp": "v=0", "type": "offer", "sessionId": session_id }),
    )
    .await;
    assert_eq!(resp.status(), 200);

    let mut agent = gw.agent.take(0);
    let peer = gw.peers.take(0);

    ws.close(None).await.unwrap();

    wait_until(|| gw.state.sessions.is_empty()).await;
    wait_until(|| !gw.state.connections.contains(&session_id)).await;
    wait_until(|| peer.transport.closes.load(Ordering::SeqCst) == 1).await;

    // Agent input queue was closed
    let closed = tokio::time::timeout(Duration::from_secs(2), agent.input.recv())
        .await
        .unwrap();
    assert!(closed.is_none());
}

#[tokio::test]
async fn test_peer_failure_removes_session() {
    let gw = start_test_gateway().await;
    let (_ws, session_id) = connect_signaling(&gw).await;

    let resp = post_offer(
        &gw,
        json!({ "sdp": "v=0", "type": "offer", "sessionId": session_id }),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let peer = gw.peers.take(0);

    peer.observer.on_state_change(TransportState::Connecting);
    peer.observer.on_state_change(TransportState::Connected);
    assert_eq!(gw.state.sessions.len(), 1);

    // A transient disconnect is not fatal
    peer.observer.on_state_change(TransportState::Disconnected);
    assert_eq!(gw.state.sessions.len(), 1);

    peer.observer.on_state_change(TransportState::Failed);
    assert!(gw.state.sessions.is_empty());
    wait_until(|| peer.transport.closes.load(Ordering::SeqCst) == 1).await;

    // The signaling connection outlives the peer
    assert!(gw.state.connections.contains(&session_id));
}

#[tokio::test]
async fn test_renegotiation_replaces_session() {
    let gw = start_test_gateway().await;
    let (_ws, session_id) = connect_signaling(&gw).await;
    let body = json!({ "sdp": "v=0", "type": "offer", "sessionId": session_id });

    assert_eq!(post_offer(&gw, body.clone()).await.status(), 200);
    assert_eq!(post_offer(&gw, body).await.status(), 200);
    assert_eq!(gw.state.sessions.len(), 1);

    let mut first = gw.agent.take(0);
    let closed = tokio::time::timeout(Duration::from_secs(2), first.input.recv())
        .await
        .unwrap();
    assert!(closed.is_none());

    let old_peer = gw.peers.take(0);
    wait_until(|| old_peer.transport.closes.load(Ordering::SeqCst) == 1).await;

    // A late failure report from the old peer leaves the new session alone
    old_peer.observer.on_state_change(TransportState::Failed);
    assert_eq!(gw.state.sessions.len(), 1);
}

#[tokio::test]
async fn test_inbound_audio_reaches_agent() {
    let gw = start_test_gateway().await;
    let (_ws, session_id) = connect_signaling(&gw).await;

    let resp = post_offer(
        &gw,
        json!({ "sdp": "v=0", "type": "offer", "sessionId": session_id }),
    )
    .await;
    assert_eq!(resp.status(), 200);

    let mut agent = gw.agent.take(0);
    let peer = gw.peers.take(0);

    let samples: Vec<i16> = (0..320).map(|i| (i % 50) as i16 * 100).collect();
    peer.observer.on_track(Box::new(OneShotTrack {
        frame: Some(MediaFrame::Audio {
            samples: samples.clone(),
            sample_rate: 16_000,
            channels: 1,
        }),
    }));

    let blob = tokio::time::timeout(Duration::from_secs(2), agent.input.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(blob.mime_type.starts_with("audio/pcm"));
    assert_eq!(blob.data.len(), samples.len() * 2);
}

#[tokio::test]
async fn test_shutdown_tears_down_all_sessions() {
    let gw = start_test_gateway().await;
    let (_ws, session_id) = connect_signaling(&gw).await;

    let resp = post_offer(
        &gw,
        json!({ "sdp": "v=0", "type": "offer", "sessionId": session_id }),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let peer = gw.peers.take(0);

    assert_eq!(gw.state.shutdown_sessions(), 1);
    assert!(gw.state.sessions.is_empty());
    wait_until(|| peer.transport.closes.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn test_failed_negotiation_opens_no_agent() {
    let gw = start_test_gateway_with(Config::default(), Arc::new(FailingPeers)).await;
    let (_ws, session_id) = connect_signaling(&gw).await;

    let resp = post_offer(
        &gw,
        json!({ "sdp": "v=0", "type": "offer", "sessionId": session_id }),
    )
    .await;
    assert_eq!(resp.status(), 500);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("ICE gathering failed"));

    assert!(gw.state.sessions.is_empty());
    assert!(gw.agent.opened.lock().is_empty());
    assert!(gw.state.connections.contains(&session_id));
}

#[tokio::test]
async fn test_negotiation_timeout_releases_session() {
    let config = Config {
        gateway: Some(GatewayConfig {
            negotiation_timeout_secs: 1,
            ..Default::default()
        }),
        ..Default::default()
    };
    let gw = start_test_gateway_with(config, Arc::new(HangingPeers::default())).await;
    let (_ws, session_id) = connect_signaling(&gw).await;

    let offer = tokio::spawn({
        let url = gw.url("/offer");
        let body = json!({ "sdp": "v=0", "type": "offer", "sessionId": session_id });
        async move {
            reqwest::Client::new()
                .post(url)
                .json(&body)
                .send()
                .await
                .unwrap()
                .status()
        }
    });

    // A session still negotiating is not visible yet
    wait_until(|| gw.peers.pacers.lock().len() == 1).await;
    let health: Value = reqwest::get(gw.url("/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["sessions"], 0);

    assert_eq!(offer.await.unwrap(), 504);
    assert!(gw.state.sessions.is_empty());
    assert!(gw.agent.opened.lock().is_empty());

    // The abandoned session's pacer was closed by teardown
    let mut pacer = gw.peers.pacers.lock().remove(0);
    let ended = tokio::time::timeout(Duration::from_secs(2), pacer.pull())
        .await
        .unwrap();
    assert!(ended.is_none());
}

#[tokio::test]
async fn test_slower_concurrent_offer_displaces_faster_one() {
    let gw = start_test_gateway_with(Config::default(), Arc::new(GatedPeers::default())).await;
    let (_ws, session_id) = connect_signaling(&gw).await;
    let body = json!({ "sdp": "v=0", "type": "offer", "sessionId": session_id });

    let slow = tokio::spawn({
        let url = gw.url("/offer");
        let body = body.clone();
        async move {
            reqwest::Client::new()
                .post(url)
                .json(&body)
                .send()
                .await
                .unwrap()
                .status()
        }
    });
    wait_until(|| gw.peers.held.load(Ordering::SeqCst) == 1).await;

    assert_eq!(post_offer(&gw, body).await.status(), 200);
    assert_eq!(gw.state.sessions.len(), 1);

    gw.peers.release.notify_one();
    assert_eq!(slow.await.unwrap(), 200);
    assert_eq!(gw.state.sessions.len(), 1);

    // The faster offer's session was displaced and fully released
    let mut displaced = gw.agent.take(0);
    let closed = tokio::time::timeout(Duration::from_secs(2), displaced.input.recv())
        .await
        .unwrap();
    assert!(closed.is_none());
    let displaced_peer = gw.peers.inner.take(0);
    wait_until(|| displaced_peer.transport.closes.load(Ordering::SeqCst) == 1).await;

    let current = gw.peers.inner.take(0);
    assert_eq!(current.transport.closes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_agent_audio_matches_output_rate() {
    let config = Config {
        audio: Some(AudioConfig {
            output_sample_rate: 48_000,
            ..Default::default()
        }),
        ..Default::default()
    };
    let gw = start_test_gateway_with(config, Arc::new(FakePeers::default())).await;
    let (_ws, session_id) = connect_signaling(&gw).await;

    let resp = post_offer(
        &gw,
        json!({
            "sdp": "v=0",
            "type": "offer",
            "responseType": "audio",
            "sessionId": session_id,
        }),
    )
    .await;
    assert_eq!(resp.status(), 200);

    let agent = gw.agent.take(0);
    let mut peer = gw.peers.take(0);
    assert_eq!(peer.pacer.format().sample_rate, 48_000);

    // 20ms at 24kHz
    let pcm: Vec<u8> = (0..480i16).flat_map(|_| 3000i16.to_le_bytes()).collect();
    agent
        .events
        .send(Ok(AgentEvent::binary("audio/pcm;rate=24000", pcm)))
        .unwrap();

    for _ in 0..20 {
        peer.pacer.pull().await.unwrap();
        if peer.pacer.stats().bytes_received > 0 {
            break;
        }
    }
    // Resampled to 20ms at 48kHz, not played back at double speed
    assert_eq!(peer.pacer.stats().bytes_received, 1920);
}
