//! Metric names and recording helpers.
//!
//! Everything goes through the `metrics` facade; without an installed
//! recorder the calls are no-ops, so the library never wires an exporter
//! itself.

use std::time::{Duration, Instant};

pub const COMMAND_SECONDS: &str = "orderly_command_seconds";
pub const CONSUMERS: &str = "orderly_consumers";
pub const CLIENT_REQUEST_SECONDS: &str = "orderly_client_request_seconds";
pub const CLIENT_REQUEST_ERRORS: &str = "orderly_client_request_errors_total";
pub const CLIENT_TRANSMIT_ERRORS: &str = "orderly_client_transmit_errors_total";
pub const SNAPSHOT_AGE: &str = "orderly_snapshots_age_seconds";
pub const SNAPSHOT_SIZE: &str = "orderly_snapshots_size_bytes";
pub const SNAPSHOT_LATEST_AGE: &str = "orderly_snapshot_latest_age_seconds";
pub const SNAPSHOT_RUNS: &str = "orderly_snapshot_runs_total";

/// Runs `f` and records its latency under `method`.
#[inline]
pub fn measure<T>(method: &'static str, f: impl FnOnce() -> T) -> T {
    let start = Instant::now();
    let out = f();
    record_command(method, start.elapsed());
    out
}

#[inline]
pub fn record_command(method: &'static str, elapsed: Duration) {
    metrics::histogram!(COMMAND_SECONDS, "method" => method).record(elapsed.as_secs_f64());
}

#[inline]
pub fn inc_consumers() {
    metrics::gauge!(CONSUMERS).increment(1.0);
}

#[inline]
pub fn dec_consumers() {
    metrics::gauge!(CONSUMERS).decrement(1.0);
}

#[inline]
pub fn record_client_request(method: &'static str, elapsed: Duration) {
    metrics::histogram!(CLIENT_REQUEST_SECONDS, "method" => method).record(elapsed.as_secs_f64());
}

#[inline]
pub fn inc_client_request_errors(method: &'static str) {
    metrics::counter!(CLIENT_REQUEST_ERRORS, "method" => method).increment(1);
}

#[inline]
pub fn inc_client_transmit_errors() {
    metrics::counter!(CLIENT_TRANSMIT_ERRORS).increment(1);
}

pub fn set_snapshot_gauges(name: &str, age: Duration, size: u64) {
    metrics::gauge!(SNAPSHOT_AGE, "name" => name.to_string()).set(age.as_secs_f64());
    metrics::gauge!(SNAPSHOT_SIZE, "name" => name.to_string()).set(size as f64);
}

pub fn set_latest_snapshot_age(age: Duration) {
    metrics::gauge!(SNAPSHOT_LATEST_AGE).set(age.as_secs_f64());
}

pub fn inc_snapshot_runs(job: &'static str, outcome: &'static str) {
    metrics::counter!(SNAPSHOT_RUNS, "job" => job, "outcome" => outcome).increment(1);
}
