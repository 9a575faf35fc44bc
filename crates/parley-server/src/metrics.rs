//! Metrics collection and export for Parley.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use parley_core::RouterStats;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "parley_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "parley_connections_active";
    pub const CONNECTIONS_REJECTED: &str = "parley_connections_rejected_total";
    pub const EVENTS_TOTAL: &str = "parley_events_total";
    pub const EVENTS_BYTES: &str = "parley_events_bytes";
    pub const DELIVERIES_DROPPED: &str = "parley_deliveries_dropped_total";
    pub const ROOMS_ACTIVE: &str = "parley_rooms_active";
    pub const ONLINE_USERS: &str = "parley_online_users";
    pub const LATENCY_SECONDS: &str = "parley_dispatch_latency_seconds";
    pub const ERRORS_TOTAL: &str = "parley_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::CONNECTIONS_REJECTED,
        "Connections refused because the server was full"
    );
    metrics::describe_counter!(names::EVENTS_TOTAL, "Total number of events processed");
    metrics::describe_counter!(names::EVENTS_BYTES, "Total bytes of outbound events");
    metrics::describe_counter!(
        names::DELIVERIES_DROPPED,
        "Outbound events dropped on full connection queues"
    );
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Current number of non-empty rooms");
    metrics::describe_gauge!(names::ONLINE_USERS, "Current number of online users");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound event dispatch latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a connection refused at the limit.
pub fn record_rejected_connection() {
    counter!(names::CONNECTIONS_REJECTED).increment(1);
}

/// Record an inbound frame. Labelled by encoding, since event names are
/// client-controlled.
pub fn record_inbound(encoding: &'static str) {
    counter!(names::EVENTS_TOTAL, "direction" => "inbound", "kind" => encoding).increment(1);
}

/// Record an outbound event.
pub fn record_outbound(event: &'static str, bytes: usize) {
    counter!(names::EVENTS_TOTAL, "direction" => "outbound", "kind" => event).increment(1);
    counter!(names::EVENTS_BYTES, "direction" => "outbound").increment(bytes as u64);
}

/// Record dispatch latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Publish router gauges.
pub fn record_router_stats(stats: &RouterStats) {
    gauge!(names::ROOMS_ACTIVE).set(stats.rooms.rooms as f64);
    gauge!(names::ONLINE_USERS).set(stats.registry.online_users as f64);
    counter!(names::DELIVERIES_DROPPED).absolute(stats.outbound_dropped);
}

/// Record an error by its code.
pub fn record_error(code: &'static str) {
    counter!(names::ERRORS_TOTAL, "code" => code).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::Router;

    #[test]
    fn test_recording_without_exporter() {
        // No recorder installed: every call must be a no-op
        let _guard = ConnectionMetricsGuard::new();
        record_inbound("json");
        record_outbound("new-message", 42);
        record_error("invalid-payload");
        record_router_stats(&Router::new().stats());
    }
}
