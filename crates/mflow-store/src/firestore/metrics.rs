//! Job store request metrics.

use metrics::{counter, histogram};

pub mod names {
    /// Firestore requests by operation and status.
    pub const REQUESTS_TOTAL: &str = "mflow_store_requests_total";

    /// Retry attempts by operation.
    pub const RETRIES_TOTAL: &str = "mflow_store_retries_total";

    /// Optimistic-concurrency conflicts by operation.
    pub const CONFLICTS_TOTAL: &str = "mflow_store_conflicts_total";

    /// Request latency in seconds by operation.
    pub const LATENCY_SECONDS: &str = "mflow_store_latency_seconds";
}

pub fn record_request(operation: &'static str, status: u16, latency_ms: f64) {
    counter!(
        names::REQUESTS_TOTAL,
        "operation" => operation,
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(names::LATENCY_SECONDS, "operation" => operation).record(latency_ms / 1000.0);
}

pub fn record_retry(operation: &'static str) {
    counter!(names::RETRIES_TOTAL, "operation" => operation).increment(1);
}

pub fn record_conflict(operation: &'static str) {
    counter!(names::CONFLICTS_TOTAL, "operation" => operation).increment(1);
}
