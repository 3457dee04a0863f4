//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define server lifecycle metrics (runs, restarts, connections, requests)
//! - Expose a Prometheus-compatible scrape endpoint
//!
//! # Metrics
//! - `rebind_runs_total` (counter): accept loops started
//! - `rebind_restarts_total` (counter): restarts requested
//! - `rebind_running` (gauge): 1 while a run is serving
//! - `rebind_run_failures_total` (counter): runs that ended with an error
//! - `rebind_connections_active` (gauge): open connections
//! - `rebind_requests_total` (counter): requests by method, status
//! - `rebind_request_duration_seconds` (histogram): latency distribution
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op, so tests need no setup
//! - Histogram buckets tuned for typical web latencies

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder};

const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Install the Prometheus recorder and its HTTP scrape listener.
///
/// Must be called from inside a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Full("rebind_request_duration_seconds".to_string()),
            LATENCY_BUCKETS,
        )?
        .install()?;

    tracing::info!(address = %addr, "Prometheus metrics endpoint listening");
    Ok(())
}

pub fn record_run_started() {
    metrics::counter!("rebind_runs_total").increment(1);
    metrics::gauge!("rebind_running").set(1.0);
}

pub fn record_run_finished(graceful: bool) {
    metrics::gauge!("rebind_running").set(0.0);
    if !graceful {
        metrics::counter!("rebind_run_failures_total").increment(1);
    }
}

pub fn record_restart() {
    metrics::counter!("rebind_restarts_total").increment(1);
}

pub fn record_connection_opened() {
    metrics::gauge!("rebind_connections_active").increment(1.0);
}

pub fn record_connection_closed() {
    metrics::gauge!("rebind_connections_active").decrement(1.0);
}

pub fn record_request(method: &str, status: u16, start_time: Instant) {
    metrics::counter!(
        "rebind_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!("rebind_request_duration_seconds").record(start_time.elapsed().as_secs_f64());
}
