use std::net::SocketAddr;

use crate::wire::Op;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "shelfd_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "shelfd_request_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "shelfd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "shelfd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "shelfd_connections_rejected_total";

/// Gauge: libraries with a loaded engine.
pub const LIBRARIES_ACTIVE: &str = "shelfd_libraries_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "shelfd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "shelfd_wal_flush_batch_size";

// ── Circulation ─────────────────────────────────────────────────

/// Counter: promoted reservations that ran out of hold window.
pub const HOLDS_LAPSED_TOTAL: &str = "shelfd_holds_lapsed_total";

/// Counter: ledger refusals that should be impossible (defects).
pub const INVARIANT_VIOLATIONS_TOTAL: &str = "shelfd_invariant_violations_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a request op to a short label for metrics.
pub fn op_label(op: &Op) -> &'static str {
    match op {
        Op::RegisterBook { .. } => "register_book",
        Op::SetTotalCopies { .. } => "set_total_copies",
        Op::Borrow { .. } => "borrow",
        Op::Return { .. } => "return",
        Op::Reserve { .. } => "reserve",
        Op::CancelReservation { .. } => "cancel_reservation",
        Op::GetBook { .. } => "get_book",
        Op::GetLoan { .. } => "get_loan",
        Op::GetReservation { .. } => "get_reservation",
        Op::ListBooks => "list_books",
        Op::ListLoans { .. } => "list_loans",
        Op::ListActiveLoans { .. } => "list_active_loans",
        Op::ListOverdueLoans => "list_overdue_loans",
        Op::ListReservations { .. } => "list_reservations",
        Op::Listen { .. } => "listen",
    }
}
