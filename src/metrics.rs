//! Lightweight metrics helpers for the gateway.
//!
//! Thin wrappers over the `metrics` crate macros. No exporter is embedded;
//! the application may install any compatible recorder. Alongside the
//! recorder, endpoint gauges are mirrored into a process-local snapshot map
//! so the diagnostics listener (and tests) can read current values.
//!
//! Provided metrics:
//! * `endpoint` (gauge per `host:port`, 1.0 up / 0.0 down)
//! * `xavi_requests_total` (counter, labels: route, status)
//! * `xavi_request_duration_seconds` (histogram, label: route)
use std::{collections::HashMap, sync::Mutex, time::Instant};

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::Lazy;

/// Gauge family recording per-endpoint health, keyed by connect address.
pub const ENDPOINT_GAUGE: &str = "endpoint";
pub const REQUESTS_TOTAL: &str = "xavi_requests_total";
pub const REQUEST_DURATION_SECONDS: &str = "xavi_request_duration_seconds";

/// Snapshot of the endpoint gauge family.
static ENDPOINT_GAUGES: Lazy<Mutex<HashMap<String, f64>>> = Lazy::new(|| {
    describe_gauge!(
        ENDPOINT_GAUGE,
        "Health of an individual endpoint (1 up, 0 down), labelled by connect address"
    );
    describe_counter!(
        REQUESTS_TOTAL,
        Unit::Count,
        "Total number of requests dispatched by the gateway."
    );
    describe_histogram!(
        REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of requests dispatched by the gateway."
    );

    Mutex::new(HashMap::new())
});

/// Set (and record) the health gauge for an endpoint connect address.
pub fn set_endpoint_status(address: &str, up: bool) {
    let value = if up { 1.0 } else { 0.0 };

    if let Ok(mut gauges) = ENDPOINT_GAUGES.lock() {
        gauges.insert(address.to_string(), value);
    } else {
        tracing::error!("failed to acquire lock for endpoint gauges");
        return;
    }

    gauge!(ENDPOINT_GAUGE, "address" => address.to_string()).set(value);
}

/// Increment the dispatched-request counter.
pub fn increment_request_total(route: &str, status: u16) {
    counter!(
        REQUESTS_TOTAL,
        "route" => route.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a completed request's duration.
pub fn record_request_duration(route: &str, duration: std::time::Duration) {
    histogram!(REQUEST_DURATION_SECONDS, "route" => route.to_string())
        .record(duration.as_secs_f64());
}

/// RAII helper measuring request dispatch duration.
pub struct RequestTimer {
    start: Instant,
    route: String,
}

impl RequestTimer {
    pub fn new(route: &str) -> Self {
        Self {
            start: Instant::now(),
            route: route.to_string(),
        }
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        record_request_duration(&self.route, self.start.elapsed());
    }
}

/// Register metric descriptions (idempotent).
pub fn init_metrics() {
    Lazy::force(&ENDPOINT_GAUGES);
}

/// Collect a snapshot of the endpoint gauge values for ad-hoc exports.
pub fn endpoint_gauge_snapshot() -> HashMap<String, f64> {
    ENDPOINT_GAUGES
        .lock()
        .map(|gauges| gauges.clone())
        .unwrap_or_default()
}
