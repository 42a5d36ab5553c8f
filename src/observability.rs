use std::net::SocketAddr;

use crate::sql::Command;

// ── Request metrics ─────────────────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "fitbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "fitbook_query_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: booking attempts by result. Labels: outcome
/// (booked, moved, unchanged, cancelled, fully_booked, allowance_exhausted, ...).
pub const RESERVATIONS_TOTAL: &str = "fitbook_reservations_total";

/// Counter: grants issued. Labels: payment_state.
pub const GRANTS_ISSUED_TOTAL: &str = "fitbook_grants_issued_total";

// ── Resource utilization ────────────────────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "fitbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "fitbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "fitbook_connections_rejected_total";

/// Gauge: number of loaded tenants (one engine per gym).
pub const TENANTS_ACTIVE: &str = "fitbook_tenants_active";

/// Counter: cleartext password challenges issued during startup. Labels: gym
/// (or `rejected` when the database name cannot name a gym).
pub const AUTH_CHALLENGES_TOTAL: &str = "fitbook_auth_challenges_total";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "fitbook_wal_compactions_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "fitbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "fitbook_wal_flush_batch_size";

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

/// Short metrics label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::UpsertFacility { .. } => "upsert_facility",
        Command::SetFacilityHours { .. } => "set_facility_hours",
        Command::DefinePlan { .. } => "define_plan",
        Command::RegisterMember { .. } => "register_member",
        Command::SetAllowance { .. } => "set_allowance",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::CancelReservation { .. } => "cancel_reservation",
        Command::InsertGrant { plan_id: Some(_), .. } => "issue_grant",
        Command::InsertGrant { plan_id: None, .. } => "renew_grant",
        Command::InvalidateGrant { .. } => "invalidate_grant",
        Command::ExtendGrant { .. } => "extend_grant",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectActiveGrants { .. } => "select_active_grants",
        Command::SelectGrants { .. } => "select_grants",
        Command::SelectMember { .. } => "select_member",
    }
}
