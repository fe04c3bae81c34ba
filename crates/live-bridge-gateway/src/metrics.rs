//! Prometheus metrics recording and endpoint.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use parking_lot::Mutex;

static HANDLE: Mutex<Option<PrometheusHandle>> = parking_lot::const_mutex(None);

/// Install the Prometheus recorder once per process and return its handle.
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    let mut slot = HANDLE.lock();
    if let Some(handle) = slot.as_ref() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    *slot = Some(handle.clone());
    Ok(handle)
}

/// Record a new signaling connection.
pub fn record_ws_connect() {
    metrics::gauge!("signaling_connections_active").increment(1.0);
}

/// Record a signaling disconnection.
pub fn record_ws_disconnect() {
    metrics::gauge!("signaling_connections_active").decrement(1.0);
}

pub fn record_session_start() {
    metrics::gauge!("sessions_active").increment(1.0);
}

pub fn record_session_end() {
    metrics::gauge!("sessions_active").decrement(1.0);
}

/// An outbound frame that left later than its frame period.
pub fn record_late_frame() {
    metrics::counter!("outbound_late_frames_total").increment(1);
}

/// Record an offer outcome with its duration.
pub fn record_offer(outcome: &str, duration_secs: f64) {
    let labels = [("outcome", outcome.to_string())];
    metrics::counter!("offers_total", &labels).increment(1);
    metrics::histogram!("offer_duration_seconds", &labels).record(duration_secs);
}
