//! Metrics collection and exposition.
//!
//! # Metrics
//! - `wsproxy_dial_failures_total` (counter): failed backend dials by `kind` (hard, soft)
//! - `wsproxy_upgrade_failures_total` (counter): inbound upgrades that were rejected or lost
//! - `wsproxy_sessions_active` (gauge): relay sessions currently open
//! - `wsproxy_messages_total` (counter): data messages relayed by `direction`

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::websocket::relay::Direction;

/// Install the Prometheus exporter on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(err) => tracing::error!(address = %addr, error = %err, "Failed to install metrics exporter"),
    }
}

/// Kind of dial failure, used as a label.
#[derive(Debug, Clone, Copy)]
pub enum DialFailure {
    /// Nothing came back from the backend.
    Hard,
    /// The backend answered with plain HTTP.
    Soft,
}

pub fn record_dial_failure(kind: DialFailure) {
    let kind = match kind {
        DialFailure::Hard => "hard",
        DialFailure::Soft => "soft",
    };
    metrics::counter!("wsproxy_dial_failures_total", "kind" => kind).increment(1);
}

pub fn record_upgrade_failure() {
    metrics::counter!("wsproxy_upgrade_failures_total").increment(1);
}

pub fn session_opened() {
    metrics::gauge!("wsproxy_sessions_active").increment(1.0);
}

pub fn session_closed() {
    metrics::gauge!("wsproxy_sessions_active").decrement(1.0);
}

pub fn record_message(direction: Direction) {
    metrics::counter!("wsproxy_messages_total", "direction" => direction.as_str()).increment(1);
}
