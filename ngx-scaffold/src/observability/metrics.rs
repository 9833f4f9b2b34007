//! Metrics collection.
//!
//! Prometheus-compatible counters and histograms for suite runs. Label
//! values come from closed sets (block result, expectation kind), so no
//! cardinality guard is needed beyond those enums.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::error::ScaffoldError;

static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initializes the global metrics recorder.
///
/// When `port` is `Some`, a Prometheus HTTP listener is started on
/// `127.0.0.1:<port>`. When `None`, the recorder is installed without an
/// HTTP endpoint.
///
/// # Errors
///
/// Returns `ScaffoldError::Io` if the recorder or HTTP listener cannot be
/// installed (e.g. port already in use).
pub fn init_metrics(port: Option<u16>) -> Result<(), ScaffoldError> {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        tracing::debug!("metrics already initialized, skipping");
        return Ok(());
    }
    port.map_or_else(
        || PrometheusBuilder::new().install_recorder().map(|_| ()),
        |p| {
            PrometheusBuilder::new()
                .with_http_listener(([127, 0, 0, 1], p))
                .install()
        },
    )
    .map_err(|e| ScaffoldError::Io(std::io::Error::other(e.to_string())))?;

    describe_metrics();
    Ok(())
}

fn describe_metrics() {
    describe_counter!(
        "ngx_scaffold_blocks_total",
        "Blocks run, labelled by result"
    );
    describe_counter!(
        "ngx_scaffold_mismatches_total",
        "Expectation mismatches, labelled by expectation kind"
    );
    describe_counter!(
        "ngx_scaffold_server_starts_total",
        "Server-under-test starts, labelled by outcome"
    );
    describe_counter!(
        "ngx_scaffold_reloads_total",
        "Server-under-test reloads, labelled by outcome"
    );
    describe_histogram!(
        "ngx_scaffold_block_duration_ms",
        "Block wall time in milliseconds"
    );
}

/// Records one finished block.
pub fn record_block(passed: bool, duration: Duration) {
    let result = if passed { "pass" } else { "fail" };
    counter!("ngx_scaffold_blocks_total", "result" => result).increment(1);
    histogram!("ngx_scaffold_block_duration_ms").record(duration.as_secs_f64() * 1000.0);
}

/// Records one expectation mismatch.
pub fn record_mismatch(expectation: &'static str) {
    counter!("ngx_scaffold_mismatches_total", "expectation" => expectation).increment(1);
}

/// Records a server start attempt.
pub fn record_server_start(ready: bool) {
    let outcome = if ready { "ready" } else { "failed" };
    counter!("ngx_scaffold_server_starts_total", "outcome" => outcome).increment(1);
}

/// Records a reload attempt.
pub fn record_reload(ok: bool) {
    let outcome = if ok { "ok" } else { "failed" };
    counter!("ngx_scaffold_reloads_total", "outcome" => outcome).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        record_block(true, Duration::from_millis(12));
        record_block(false, Duration::ZERO);
        record_mismatch("response_body");
        record_server_start(true);
        record_reload(false);
    }
}
