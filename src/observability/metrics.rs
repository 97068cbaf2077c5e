//! Metrics collection and exposition.
//!
//! # Metrics
//! - `admin_queue_appended_total` (counter): accepted appends by queue
//! - `admin_queue_saturated_total` (counter): appends rejected on a full buffer
//! - `admin_queue_dispatched_total` (counter): handler invocations by queue, topic, outcome
//! - `admin_queue_dispatch_duration_seconds` (histogram): handler latency
//! - `admin_queue_dropped_total` (counter): messages given up on, by reason
//! - `admin_http_requests_total` (counter): requests seen by the operation log

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_queue_appended(queue: &str) {
    counter!("admin_queue_appended_total", "queue" => queue.to_string()).increment(1);
}

pub fn record_queue_saturated(queue: &str) {
    counter!("admin_queue_saturated_total", "queue" => queue.to_string()).increment(1);
}

pub fn record_queue_dispatch(queue: &str, topic: &str, ok: bool, started: Instant) {
    let outcome = if ok { "ok" } else { "error" };
    counter!(
        "admin_queue_dispatched_total",
        "queue" => queue.to_string(),
        "topic" => topic.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    histogram!(
        "admin_queue_dispatch_duration_seconds",
        "queue" => queue.to_string(),
        "topic" => topic.to_string()
    )
    .record(started.elapsed().as_secs_f64());
}

pub fn record_queue_dropped(queue: &str, reason: &'static str, count: u64) {
    counter!("admin_queue_dropped_total", "queue" => queue.to_string(), "reason" => reason).increment(count);
}

pub fn record_http_request(method: &str, status: u16) {
    counter!(
        "admin_http_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}
