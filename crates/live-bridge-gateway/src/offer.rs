//! Offer/answer negotiation for `POST /offer`.

use std::sync::Arc;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{info, warn};

use live_bridge_agent::AgentBridge;
use live_bridge_core::protocol::{ErrorBody, OfferRequest, SessionDescription};
use live_bridge_media::{AudioPacer, IngressSettings};

use crate::session::Session;
use crate::state::GatewayState;

#[derive(Debug, thiserror::Error)]
pub enum OfferError {
    #[error("sessionId is required")]
    MissingSessionId,

    #[error("no signaling connection for session {0}")]
    UnknownSession(String),

    #[error("expected an offer, got {0:?}")]
    NotAnOffer(String),

    #[error("negotiation timed out")]
    Timeout,

    #[error("negotiation failed: {0:#}")]
    Negotiation(anyhow::Error),

    #[error("agent session failed: {0:#}")]
    Agent(anyhow::Error),
}

impl OfferError {
    fn status(&self) -> StatusCode {
        match self {
            Self::MissingSessionId | Self::NotAnOffer(_) => StatusCode::BAD_REQUEST,
            Self::UnknownSession(_) => StatusCode::NOT_FOUND,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Negotiation(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Agent(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for OfferError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

/// Build a session for `req` and return the local answer.
///
/// The agent bridge is only started once the answer is final, so a failed
/// negotiation never opens an agent session. A concurrent offer for the same
/// id that finishes first is displaced and torn down.
pub async fn negotiate(
    state: &Arc<GatewayState>,
    req: OfferRequest,
) -> Result<SessionDescription, OfferError> {
    let session_id = req
        .session_id
        .filter(|id| !id.is_empty())
        .ok_or(OfferError::MissingSessionId)?;
    if !state.connections.contains(&session_id) {
        return Err(OfferError::UnknownSession(session_id));
    }
    if req.sdp_type != "offer" {
        return Err(OfferError::NotAnOffer(req.sdp_type));
    }

    if let Some(previous) = state.sessions.remove(&session_id) {
        info!(session_id = %session_id, "Renegotiating, replacing existing session");
        previous.teardown();
    }

    let audio = state.config.audio();
    let (pacer_sink, pacer) =
        AudioPacer::channel(state.config.output_frame_format(), state.config.underrun_timeout());
    let settings = IngressSettings {
        input_sample_rate: audio.input_sample_rate,
        jpeg_quality: state.config.video().jpeg_quality,
    };
    // Not registered until a transport exists, so /health and shutdown only
    // see sessions with something to tear down.
    let session = Session::new(&session_id, pacer_sink.clone(), settings, &state.sessions);
    session.begin_negotiation();

    info!(
        session_id = %session_id,
        response_type = %req.response_type,
        "Negotiating peer connection"
    );

    let offer = SessionDescription::offer(req.sdp);
    let connect = state.peers.connect(offer, pacer, session.clone());
    let (answer, transport) = match tokio::time::timeout(state.config.negotiation_timeout(), connect).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            warn!(session_id = %session_id, error = %e, "Negotiation failed");
            session.teardown();
            return Err(OfferError::Negotiation(e));
        }
        Err(_) => {
            warn!(session_id = %session_id, "Negotiation timed out");
            session.teardown();
            return Err(OfferError::Timeout);
        }
    };

    if !session.attach_transport(transport) {
        return Err(OfferError::Negotiation(anyhow::anyhow!(
            "session closed during negotiation"
        )));
    }
    state.sessions.register(session.clone());

    let bridge = Arc::new(AgentBridge::new(
        session_id.clone(),
        state.agent.clone(),
        state.connections.clone(),
        pacer_sink,
    ));
    if !session.attach_bridge(bridge.clone()) {
        return Err(OfferError::Agent(anyhow::anyhow!(
            "session closed before agent start"
        )));
    }
    if let Err(e) = bridge.start(req.response_type).await {
        warn!(session_id = %session_id, error = %e, "Agent bridge failed to start");
        session.teardown();
        return Err(OfferError::Agent(e));
    }

    // The signaling connection may have gone away while negotiating
    if !state.connections.contains(&session_id) {
        session.teardown();
        return Err(OfferError::UnknownSession(session_id));
    }

    info!(session_id = %session_id, "Session established");
    Ok(answer)
}
