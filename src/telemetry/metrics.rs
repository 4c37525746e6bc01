//! Counters and histograms recorded through the `metrics` facade.
//!
//! No exporter is installed here; the embedding process chooses one.

use std::time::Duration;

pub const DISPATCH_TOTAL: &str = "rpc_dispatch_total";
pub const DISPATCH_SECONDS: &str = "rpc_dispatch_seconds";
pub const POOL_BUILD_TOTAL: &str = "rpc_pool_build_total";
pub const POOL_RENEW_TOTAL: &str = "rpc_pool_renew_total";
pub const LOG_SINK_EVICTED_TOTAL: &str = "rpc_log_sink_evicted_total";

/// Record one dispatch with its outcome label (`ok` or an error kind).
pub fn record_dispatch(outcome: &'static str, elapsed: Duration) {
    metrics::counter!(DISPATCH_TOTAL, "outcome" => outcome).increment(1);
    metrics::histogram!(DISPATCH_SECONDS).record(elapsed.as_secs_f64());
}

pub fn record_pool_build(service: &str) {
    metrics::counter!(POOL_BUILD_TOTAL, "service" => service.to_string()).increment(1);
}

pub fn record_pool_renew(service: &str) {
    metrics::counter!(POOL_RENEW_TOTAL, "service" => service.to_string()).increment(1);
}

pub fn record_sink_evicted(count: usize) {
    metrics::counter!(LOG_SINK_EVICTED_TOTAL).increment(count as u64);
}
