use crate::models::{CaptureSource, ConnectionStatus, QueueCounts};
use metrics::{counter, gauge};
use tracing::trace;

// Thin wrappers over the `metrics` facade. Without an installed recorder
// these are no-ops, which keeps library tests free of global state.

pub fn inc_requests(route: &'static str) {
    counter!("ingest_requests_total", "route" => route).increment(1);
    trace!(target = "ingest.metrics", route, "requests_total_inc");
}

pub fn capture_received(source: CaptureSource) {
    counter!("ingest_captures_total", "source" => source.as_str()).increment(1);
}

pub fn enqueue_outcome(outcome: &'static str) {
    counter!("ingest_enqueue_total", "outcome" => outcome).increment(1);
}

pub fn terminal_outcome(outcome: &'static str) {
    counter!("ingest_terminal_total", "outcome" => outcome).increment(1);
}

pub fn upload_attempt(result: &'static str, elapsed_ms: u128) {
    counter!("ingest_upload_attempts_total", "result" => result).increment(1);
    trace!(
        target = "ingest.metrics",
        result,
        elapsed_ms = elapsed_ms as u64,
        "upload_attempt_elapsed"
    );
}

pub fn queue_depth(counts: QueueCounts) {
    gauge!("ingest_queue_items", "state" => "pending").set(counts.pending as f64);
    gauge!("ingest_queue_items", "state" => "inflight").set(counts.inflight as f64);
    gauge!("ingest_queue_items", "state" => "retry-wait").set(counts.retry_wait as f64);
}

pub fn connection_status(status: ConnectionStatus) {
    let value = match status {
        ConnectionStatus::Healthy => 2.0,
        ConnectionStatus::Degraded => 1.0,
        ConnectionStatus::Down => 0.0,
    };
    gauge!("ingest_backend_connection").set(value);
}
