use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: reservation attempts. Labels: outcome (won/conflict/rejected).
pub const RESERVATIONS_TOTAL: &str = "benchbook_reservations_total";

/// Counter: reservations lost to a competing booking.
pub const CONFLICTS_TOTAL: &str = "benchbook_conflicts_total";

/// Counter: reserved rows cancelled because a competitor won the tie-break.
pub const EVICTIONS_TOTAL: &str = "benchbook_evictions_total";

/// Counter: confirm operations that completed.
pub const CONFIRMATIONS_TOTAL: &str = "benchbook_confirmations_total";

/// Counter: cancel operations, full and partial.
pub const CANCELLATIONS_TOTAL: &str = "benchbook_cancellations_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: number of active registries (loaded engines).
pub const REGISTRIES_ACTIVE: &str = "benchbook_registries_active";

/// Counter: calendar sync attempts that failed (per attempt, not per job).
pub const CALENDAR_SYNC_FAILURES_TOTAL: &str = "benchbook_calendar_sync_failures_total";

/// Counter: calendar sync jobs dropped after exhausting retries.
pub const CALENDAR_SYNC_DROPPED_TOTAL: &str = "benchbook_calendar_sync_dropped_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "benchbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "benchbook_wal_flush_batch_size";

/// Install the Prometheus metrics exporter on the given port. No-op if
/// `port` is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}
