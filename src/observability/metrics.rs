//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define keyserver metrics (requests, latency, connection failures)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `keyless_requests_total` (counter): requests read, by opcode
//! - `keyless_request_duration_seconds` (histogram): receipt to response written, by opcode and status
//! - `keyless_connection_failures_total` (counter): connections torn down by an error
//! - `keyless_active_connections` (gauge): currently tracked server connections
//! - `keyless_pool_queue_rejections_total` (counter): jobs refused by a closed pool
//! - `keyless_dial_failures_total` (counter): client-side failed dials

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::protocol::{ErrorCode, Op};

/// Install the Prometheus recorder and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(opcode: Op) {
    ::metrics::counter!("keyless_requests_total", "opcode" => opcode.name()).increment(1);
}

/// Record the time from packet receipt until its response hit the wire.
pub fn record_request_duration(opcode: Op, began: Instant, error: Option<ErrorCode>) {
    let status = error.map_or("ok", ErrorCode::label);
    ::metrics::histogram!(
        "keyless_request_duration_seconds",
        "opcode" => opcode.name(),
        "status" => status
    )
    .record(began.elapsed().as_secs_f64());
}

pub fn record_connection_failure() {
    ::metrics::counter!("keyless_connection_failures_total").increment(1);
}

pub fn record_active_connections(count: usize) {
    ::metrics::gauge!("keyless_active_connections").set(count as f64);
}

pub fn record_pool_rejection(pool: &str) {
    ::metrics::counter!("keyless_pool_queue_rejections_total", "pool" => pool.to_string()).increment(1);
}

pub fn record_dial_failure() {
    ::metrics::counter!("keyless_dial_failures_total").increment(1);
}
