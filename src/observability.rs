use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "courtbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "courtbook_query_duration_seconds";

// ── Scheduling ──────────────────────────────────────────────────

/// Counter: hourly slots computed for day-slot queries.
pub const SLOTS_COMPUTED_TOTAL: &str = "courtbook_slots_computed_total";

/// Counter: recurrence previews generated.
pub const RECURRENCE_PREVIEWS_TOTAL: &str = "courtbook_recurrence_previews_total";

/// Counter: reservation writes refused by the uniqueness or overlap check.
pub const RESERVATION_CONFLICTS_TOTAL: &str = "courtbook_reservation_conflicts_total";

/// Counter: pending reservations canceled after the payment window ran out.
pub const PENDING_EXPIRED_TOTAL: &str = "courtbook_pending_expired_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "courtbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "courtbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "courtbook_connections_rejected_total";

/// Gauge: number of loaded venues.
pub const TENANTS_ACTIVE: &str = "courtbook_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "courtbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "courtbook_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::SetConfig { .. } => "set_config",
        Command::SelectConfig => "select_config",
        Command::InsertCourt { .. } => "insert_court",
        Command::DeleteCourt { .. } => "delete_court",
        Command::SelectCourts => "select_courts",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::BatchInsertReservations { .. } => "batch_insert_reservations",
        Command::CancelReservation { .. } => "cancel_reservation",
        Command::ConfirmReservation { .. } => "confirm_reservation",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectRecurrencePreview { .. } => "select_recurrence_preview",
        Command::InsertRecurrence { .. } => "insert_recurrence",
        Command::SelectPeakHours { .. } => "select_peak_hours",
        Command::Listen { .. } => "listen",
    }
}
