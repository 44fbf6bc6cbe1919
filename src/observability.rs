use std::net::SocketAddr;

use metrics_exporter_prometheus::BuildError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: booking attempts. Labels: outcome (`ok` or an error kind).
pub const BOOKINGS_TOTAL: &str = "tutorcal_bookings_total";

/// Counter: cancellations. Labels: by (`student`/`teacher`), refunded.
pub const CANCELLATIONS_TOTAL: &str = "tutorcal_cancellations_total";

/// Counter: rule declarations rejected by the conflict checker.
pub const RULE_CONFLICTS_TOTAL: &str = "tutorcal_rule_conflicts_total";

/// Histogram: lock-to-apply latency of committed transactions in seconds.
pub const COMMIT_DURATION_SECONDS: &str = "tutorcal_commit_duration_seconds";

/// Counter: transactions that failed closed (lock timeout or journal retries exhausted).
pub const COMMITS_ABORTED_TOTAL: &str = "tutorcal_commits_aborted_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "tutorcal_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (transactions per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "tutorcal_wal_flush_batch_size";

/// Counter: WAL compactions performed.
pub const WAL_COMPACTIONS_TOTAL: &str = "tutorcal_wal_compactions_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init_metrics(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Install the fmt subscriber. Safe to call more than once.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt::try_init();
}
