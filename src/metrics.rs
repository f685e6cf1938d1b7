//! Prometheus instrumentation for the gateway.
//!
//! Thin helpers over the `metrics` facade. The exporter is installed once
//! at startup ([`install_recorder`]) and the handle is rendered at the
//! configured scrape path. Metric names form part of the operational
//! contract:
//!
//! * `gateway_requests_total` (counter: route, method, status)
//! * `gateway_request_duration_seconds` (histogram: route, method)
//! * `gateway_active_connections` (gauge)
//! * `gateway_rate_limit_hits_total` (counter: route)
//! * `gateway_auth_failures_total` (counter: reason)
//! * `gateway_backend_errors_total` (counter: route, backend, status)
//! * `gateway_retries_total` (counter: route, backend)
//! * `gateway_circuit_breaker_state_changes_total` (counter: backend, from, to)
//! * `gateway_circuit_breaker_state` (gauge: backend; 0=closed 1=open 2=half-open)
//! * `gateway_bulkhead_rejections_total` (counter: backend)
//! * `gateway_bulkhead_in_flight` (gauge: backend)

use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const REQUESTS_TOTAL: &str = "gateway_requests_total";
pub const REQUEST_DURATION_SECONDS: &str = "gateway_request_duration_seconds";
pub const ACTIVE_CONNECTIONS: &str = "gateway_active_connections";
pub const RATE_LIMIT_HITS_TOTAL: &str = "gateway_rate_limit_hits_total";
pub const AUTH_FAILURES_TOTAL: &str = "gateway_auth_failures_total";
pub const BACKEND_ERRORS_TOTAL: &str = "gateway_backend_errors_total";
pub const RETRIES_TOTAL: &str = "gateway_retries_total";
pub const CIRCUIT_BREAKER_STATE_CHANGES_TOTAL: &str =
    "gateway_circuit_breaker_state_changes_total";
pub const CIRCUIT_BREAKER_STATE: &str = "gateway_circuit_breaker_state";
pub const BULKHEAD_REJECTIONS_TOTAL: &str = "gateway_bulkhead_rejections_total";
pub const BULKHEAD_IN_FLIGHT: &str = "gateway_bulkhead_in_flight";

/// Install the Prometheus recorder and return the handle used by the
/// scrape endpoint. Call once at startup, before the first request.
pub fn install_recorder() -> eyre::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| eyre::eyre!("failed to install Prometheus recorder: {e}"))?;
    describe_all();
    Ok(handle)
}

/// Register metric descriptions. Idempotent; also callable from tests
/// that exercise helpers without an exporter.
pub fn describe_all() {
    describe_counter!(REQUESTS_TOTAL, "Total HTTP requests processed");
    describe_histogram!(REQUEST_DURATION_SECONDS, "Request latency in seconds");
    describe_gauge!(
        ACTIVE_CONNECTIONS,
        "Number of in-flight requests currently being processed"
    );
    describe_counter!(RATE_LIMIT_HITS_TOTAL, "Total rate limit rejections");
    describe_counter!(AUTH_FAILURES_TOTAL, "Total authentication failures");
    describe_counter!(BACKEND_ERRORS_TOTAL, "Total backend error responses (5xx)");
    describe_counter!(RETRIES_TOTAL, "Total retry attempts");
    describe_counter!(
        CIRCUIT_BREAKER_STATE_CHANGES_TOTAL,
        "Total circuit breaker state transitions"
    );
    describe_gauge!(
        CIRCUIT_BREAKER_STATE,
        "Current circuit breaker state (0=closed, 1=open, 2=half-open)"
    );
    describe_counter!(
        BULKHEAD_REJECTIONS_TOTAL,
        "Total requests rejected by bulkhead concurrency limiter"
    );
    describe_gauge!(
        BULKHEAD_IN_FLIGHT,
        "Current number of in-flight requests per backend bulkhead"
    );
}

pub fn record_request(route: &str, method: &str, status: u16, latency: Duration) {
    counter!(
        REQUESTS_TOTAL,
        "route" => route.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string(),
    )
    .increment(1);
    histogram!(
        REQUEST_DURATION_SECONDS,
        "route" => route.to_string(),
        "method" => method.to_string(),
    )
    .record(latency.as_secs_f64());
}

pub fn record_backend_error(route: &str, backend: &str, status: u16) {
    counter!(
        BACKEND_ERRORS_TOTAL,
        "route" => route.to_string(),
        "backend" => backend.to_string(),
        "status" => status.to_string(),
    )
    .increment(1);
}

pub fn record_retry(route: &str, backend: &str) {
    counter!(
        RETRIES_TOTAL,
        "route" => route.to_string(),
        "backend" => backend.to_string(),
    )
    .increment(1);
}

pub fn record_rate_limit_hit(route: &str) {
    counter!(RATE_LIMIT_HITS_TOTAL, "route" => route.to_string()).increment(1);
}

pub fn record_auth_failure(reason: &'static str) {
    counter!(AUTH_FAILURES_TOTAL, "reason" => reason).increment(1);
}

pub fn record_breaker_transition(backend: &str, from: &'static str, to: &'static str) {
    counter!(
        CIRCUIT_BREAKER_STATE_CHANGES_TOTAL,
        "backend" => backend.to_string(),
        "from" => from,
        "to" => to,
    )
    .increment(1);
}

pub fn set_breaker_state(backend: &str, state: u8) {
    gauge!(CIRCUIT_BREAKER_STATE, "backend" => backend.to_string()).set(f64::from(state));
}

pub fn record_bulkhead_rejection(backend: &str) {
    counter!(BULKHEAD_REJECTIONS_TOTAL, "backend" => backend.to_string()).increment(1);
}

pub fn set_bulkhead_in_flight(backend: &str, in_flight: usize) {
    gauge!(BULKHEAD_IN_FLIGHT, "backend" => backend.to_string()).set(in_flight as f64);
}

/// RAII guard for the active-connections gauge.
pub struct ActiveConnectionGuard;

impl ActiveConnectionGuard {
    pub fn acquire() -> Self {
        gauge!(ACTIVE_CONNECTIONS).increment(1.0);
        Self
    }
}

impl Drop for ActiveConnectionGuard {
    fn drop(&mut self) {
        gauge!(ACTIVE_CONNECTIONS).decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helpers_accept_labels_without_recorder() {
        // With no recorder installed the macros are no-ops; the helpers
        // must still be callable from any code path.
        describe_all();
        record_request("/api", "GET", 200, Duration::from_millis(5));
        record_backend_error("/api", "http://b:1", 502);
        record_retry("/api", "http://b:1");
        record_rate_limit_hit("/api");
        record_auth_failure("invalid_token");
        record_breaker_transition("http://b:1", "closed", "open");
        set_breaker_state("http://b:1", 1);
        record_bulkhead_rejection("http://b:1");
        set_bulkhead_in_flight("http://b:1", 3);
        let guard = ActiveConnectionGuard::acquire();
        drop(guard);
    }
}
