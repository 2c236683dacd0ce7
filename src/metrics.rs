//! Lightweight metrics helpers for Switchyard.
//!
//! This module exposes a small set of convenience functions and RAII timers
//! wrapping the `metrics` crate macros. No exporter is installed here; the
//! embedding application can initialize any compatible recorder. Without one,
//! every call is a no-op.
//!
//! Provided metrics (labels vary by family):
//! * `switchyard_requests_total` (counter, by api / method / status)
//! * `switchyard_request_duration_seconds` (histogram, by api)
//! * `switchyard_upstream_requests_total` (counter, by api / status)
//! * `switchyard_upstream_errors_total` (counter, by api / kind)
//! * `switchyard_client_closed_total` (counter, by api)
//! * `switchyard_rate_limited_total` (counter, by api)
//! * `switchyard_reloads_total` (counter, by outcome)
//! * `switchyard_definition_version` (gauge)
//! * `switchyard_routes` (gauge)
use std::time::Instant;

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::Lazy;

pub const SWITCHYARD_REQUESTS_TOTAL: &str = "switchyard_requests_total";
pub const SWITCHYARD_REQUEST_DURATION_SECONDS: &str = "switchyard_request_duration_seconds";
pub const SWITCHYARD_UPSTREAM_REQUESTS_TOTAL: &str = "switchyard_upstream_requests_total";
pub const SWITCHYARD_UPSTREAM_ERRORS_TOTAL: &str = "switchyard_upstream_errors_total";
pub const SWITCHYARD_CLIENT_CLOSED_TOTAL: &str = "switchyard_client_closed_total";
pub const SWITCHYARD_RATE_LIMITED_TOTAL: &str = "switchyard_rate_limited_total";
pub const SWITCHYARD_RELOADS_TOTAL: &str = "switchyard_reloads_total"; // labels: outcome
pub const SWITCHYARD_DEFINITION_VERSION: &str = "switchyard_definition_version";
pub const SWITCHYARD_ROUTES: &str = "switchyard_routes";

/// Label used for requests that matched no route.
pub const UNMATCHED_API: &str = "-";

static DESCRIPTIONS: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        SWITCHYARD_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of HTTP requests processed by the gateway."
    );
    describe_histogram!(
        SWITCHYARD_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of HTTP requests processed by the gateway."
    );
    describe_counter!(
        SWITCHYARD_UPSTREAM_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of requests forwarded to upstream services."
    );
    describe_counter!(
        SWITCHYARD_UPSTREAM_ERRORS_TOTAL,
        Unit::Count,
        "Upstream calls that failed at the transport level."
    );
    describe_counter!(
        SWITCHYARD_CLIENT_CLOSED_TOTAL,
        Unit::Count,
        "Requests abandoned by the client before a response was produced."
    );
    describe_counter!(
        SWITCHYARD_RATE_LIMITED_TOTAL,
        Unit::Count,
        "Requests rejected by the rate plugin."
    );
    describe_counter!(
        SWITCHYARD_RELOADS_TOTAL,
        Unit::Count,
        "Definition reload attempts by outcome."
    );
    describe_gauge!(
        SWITCHYARD_DEFINITION_VERSION,
        "Version of the definition behind the active route table."
    );
    describe_gauge!(SWITCHYARD_ROUTES, "Number of routes in the active route table.");
});

/// Register metric descriptions (idempotent).
pub fn init_metrics() {
    Lazy::force(&DESCRIPTIONS);
    tracing::debug!("Switchyard metric descriptions registered");
}

/// Increment the total request counter for an inbound gateway request.
pub fn increment_request_total(api: &str, method: &str, status: u16) {
    counter!(
        SWITCHYARD_REQUESTS_TOTAL,
        "api" => api.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a completed inbound request's duration.
pub fn record_request_duration(api: &str, duration: std::time::Duration) {
    histogram!(SWITCHYARD_REQUEST_DURATION_SECONDS, "api" => api.to_string())
        .record(duration.as_secs_f64());
}

pub fn increment_upstream_request_total(api: &str, status: u16) {
    counter!(
        SWITCHYARD_UPSTREAM_REQUESTS_TOTAL,
        "api" => api.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// `kind` is `connect` or `timeout`.
pub fn increment_upstream_error(api: &str, kind: &'static str) {
    counter!(SWITCHYARD_UPSTREAM_ERRORS_TOTAL, "api" => api.to_string(), "kind" => kind)
        .increment(1);
}

pub fn increment_client_closed(api: &str) {
    counter!(SWITCHYARD_CLIENT_CLOSED_TOTAL, "api" => api.to_string()).increment(1);
}

pub fn increment_rate_limited(api: &str) {
    counter!(SWITCHYARD_RATE_LIMITED_TOTAL, "api" => api.to_string()).increment(1);
}

/// `outcome` is `applied`, `stale` or `failed`.
pub fn increment_reload(outcome: &'static str) {
    counter!(SWITCHYARD_RELOADS_TOTAL, "outcome" => outcome).increment(1);
}

/// Publish the identity of the route table now serving traffic.
pub fn set_active_table(version: i64, routes: usize) {
    gauge!(SWITCHYARD_DEFINITION_VERSION).set(version as f64);
    gauge!(SWITCHYARD_ROUTES).set(routes as f64);
}

/// RAII helper measuring inbound request duration.
///
/// The API label can be set once the request has matched.
pub struct RequestTimer {
    start: Instant,
    api: String,
}

impl RequestTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            api: UNMATCHED_API.to_string(),
        }
    }

    pub fn set_api(&mut self, api: &str) {
        self.api = api.to_string();
    }
}

impl Default for RequestTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        record_request_duration(&self.api, self.start.elapsed());
    }
}
