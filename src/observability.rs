use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "reservd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "reservd_query_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: reservations committed as active.
pub const RESERVATIONS_CREATED_TOTAL: &str = "reservd_reservations_created_total";

/// Counter: reservations cancelled by their owner or an elevated caller.
pub const RESERVATIONS_CANCELLED_TOTAL: &str = "reservd_reservations_cancelled_total";

/// Counter: reservations moved to expired by the sweeper.
pub const RESERVATIONS_EXPIRED_TOTAL: &str = "reservd_reservations_expired_total";

/// Counter: create/update requests rejected by the overlap check.
pub const CONFLICTS_TOTAL: &str = "reservd_conflicts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "reservd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "reservd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "reservd_connections_rejected_total";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "reservd_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "reservd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "reservd_wal_flush_batch_size";

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

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::SelectServers { .. } => "select_servers",
        Command::InsertServer { .. } => "insert_server",
        Command::UpdateServer { .. } => "update_server",
        Command::DeleteServer { .. } => "delete_server",
        Command::SelectReservations { .. } => "select_reservations",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::UpdateReservation { .. } => "update_reservation",
        Command::CancelReservation { .. } => "cancel_reservation",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::SelectUsers => "select_users",
        Command::InsertUser { .. } => "insert_user",
        Command::SetPassword { .. } => "set_password",
        Command::UpdateUserRole { .. } => "update_user_role",
        Command::DeleteUser { .. } => "delete_user",
        Command::Whoami => "whoami",
    }
}
