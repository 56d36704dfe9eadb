//! Metric registration and recording helpers.
//!
//! The gateway emits counters and histograms as plain data through the
//! `metrics` macros; serialization and export belong to an external
//! collector, so there is no exporter or endpoint here.

use std::time::Duration;

use metrics::{counter, describe_counter, describe_histogram, histogram};

/// Register metric descriptions once at startup.
pub fn register_metrics() {
    describe_counter!(
        "gateway_requests_total",
        "Total requests processed, labeled by method and status class"
    );
    describe_histogram!(
        "gateway_request_duration_seconds",
        "Request duration in seconds, labeled by route"
    );
    describe_counter!(
        "gateway_rejections_total",
        "Requests rejected by a policy, labeled by error code"
    );
    describe_counter!(
        "gateway_rate_limited_total",
        "Requests rejected by the rate limiter"
    );
    describe_counter!(
        "gateway_rate_limit_store_errors_total",
        "Rate limit store failures that fell open"
    );
    describe_counter!(
        "gateway_circuit_opened_total",
        "Circuit breaker transitions into the open state"
    );
    describe_counter!(
        "gateway_circuit_rejections_total",
        "Requests rejected while a circuit was open or probing"
    );
    describe_counter!(
        "gateway_retries_total",
        "Upstream replays issued by the retry policy"
    );
    describe_counter!(
        "gateway_timeouts_total",
        "Requests that reached the timeout deadline"
    );
    describe_counter!("gateway_cache_hits_total", "Responses served from the cache");
    describe_counter!("gateway_cache_misses_total", "Cache lookups that missed");
}

pub fn record_request(method: &str, route: &str, status: u16, duration: Duration) {
    let status_class = match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "unknown",
    };

    counter!(
        "gateway_requests_total",
        "method" => method.to_string(),
        "status" => status_class
    )
    .increment(1);
    histogram!("gateway_request_duration_seconds", "route" => route.to_string())
        .record(duration.as_secs_f64());
}

pub fn record_rejection(code: &'static str) {
    counter!("gateway_rejections_total", "code" => code).increment(1);
}
