//! Operational counters and gauges.
//!
//! Every metric lives in the default prometheus registry; [`gather`] renders
//! the whole set in text exposition format for whatever scrape or dump
//! mechanism the operator wires up. Label cardinality is bounded by
//! configuration (backends, hosts) and by the closed set of error kinds.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_int_counter, register_int_counter_vec, register_int_gauge_vec,
    CounterVec, IntCounter, IntCounterVec, IntGaugeVec, TextEncoder,
};

/// Reconnections initiated, per backend destination.
pub static NUM_RECONNECTS_PER_BACKEND: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "num_reconnects_per_backend",
        "Number of reconnections initiated to a backend",
        &["destination"]
    )
    .expect("metric can be registered")
});

/// Dial failures during reconnection, keyed by error message.
pub static NUM_RECONNECT_FAILURES_BY_REASON: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "num_reconnect_failures_by_reason",
        "Number of failed reconnection attempts by failure reason",
        &["errmsg"]
    )
    .expect("metric can be registered")
});

/// Seconds spent in successful dispatches, summed per backend.
pub static REQUEST_TIME_TOTAL_PER_BACKEND: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "request_time_total_per_backend",
        "Total seconds spent forwarding requests to a backend",
        &["destination"]
    )
    .expect("metric can be registered")
});

/// Requests accepted for dispatch.
pub static REQUESTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("requests_total", "Total number of requests received")
        .expect("metric can be registered")
});

/// Requests accepted, per virtual host.
pub static REQUESTS_PER_HOST: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "requests_per_host",
        "Number of requests received per virtual host",
        &["host"]
    )
    .expect("metric can be registered")
});

/// Requests successfully forwarded, per backend destination.
pub static REQUESTS_PER_BACKEND: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "requests_per_backend",
        "Number of requests forwarded per backend",
        &["destination"]
    )
    .expect("metric can be registered")
});

/// Request failures, per virtual host.
pub static REQUEST_ERRORS_PER_HOST: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "request_errors_per_host",
        "Number of request errors per virtual host",
        &["host"]
    )
    .expect("metric can be registered")
});

/// Request failures, per backend destination.
pub static REQUEST_ERRORS_PER_BACKEND: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "request_errors_per_backend",
        "Number of request errors per backend",
        &["destination"]
    )
    .expect("metric can be registered")
});

/// Request failures, by error kind.
pub static REQUEST_ERRORS_PER_ERROR_TYPE: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "request_errors_per_error_type",
        "Number of request errors by error kind",
        &["kind"]
    )
    .expect("metric can be registered")
});

/// 1 while a backend has a live, dispatchable connection, else 0.
pub static BACKENDS_READY: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "backends_ready",
        "Whether a backend currently has a ready connection",
        &["destination"]
    )
    .expect("metric can be registered")
});

/// Renders every registered metric in prometheus text exposition format.
pub fn gather() -> String {
    TextEncoder::new()
        .encode_to_string(&prometheus::gather())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_label() {
        let before = NUM_RECONNECTS_PER_BACKEND
            .with_label_values(&["metrics-test:1"])
            .get();
        NUM_RECONNECTS_PER_BACKEND
            .with_label_values(&["metrics-test:1"])
            .inc();
        let after = NUM_RECONNECTS_PER_BACKEND
            .with_label_values(&["metrics-test:1"])
            .get();
        assert_eq!(after, before + 1);
    }

    #[test]
    fn gather_includes_registered_names() {
        REQUESTS_TOTAL.inc();
        let text = gather();
        assert!(text.contains("requests_total"));
    }
}
