//! Metrics collection and exposition.
//!
//! # Metrics
//! - `secure_handshakes_total` (counter): handshakes by role, outcome
//! - `secure_connections_active` (gauge): established, not yet closed
//! - `secure_connections_lost_total` (counter): closes by reason
//! - `secure_broadcast_failures_total` (counter): failed broadcast deliveries
//!
//! Recording is a no-op until a recorder is installed.

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::net::configuration::Role;
use crate::net::connection::CloseReason;
use crate::net::handshake::ConnectionResult;

/// Install the Prometheus recorder and its HTTP scrape endpoint.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_handshake(role: Role, result: ConnectionResult) {
    ::metrics::counter!(
        "secure_handshakes_total",
        "role" => role.as_str(),
        "outcome" => result.as_str()
    )
    .increment(1);
}

pub fn record_connection_opened() {
    ::metrics::gauge!("secure_connections_active").increment(1.0);
}

pub fn record_connection_closed(reason: CloseReason) {
    ::metrics::gauge!("secure_connections_active").decrement(1.0);
    ::metrics::counter!("secure_connections_lost_total", "reason" => reason.as_str()).increment(1);
}

pub fn record_broadcast_failure() {
    ::metrics::counter!("secure_broadcast_failures_total").increment(1);
}
