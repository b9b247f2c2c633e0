use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "tutorflow_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "tutorflow_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "tutorflow_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "tutorflow_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "tutorflow_connections_rejected_total";

/// Gauge: number of open tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "tutorflow_tenants_active";

/// Counter: logins that named no usable identity.
pub const AUTH_FAILURES_TOTAL: &str = "tutorflow_auth_failures_total";

/// Histogram: journal group-commit flush duration in seconds.
pub const JOURNAL_FLUSH_DURATION_SECONDS: &str = "tutorflow_journal_flush_duration_seconds";

/// Histogram: journal group-commit batch size (events per flush).
pub const JOURNAL_FLUSH_BATCH_SIZE: &str = "tutorflow_journal_flush_batch_size";

// ── Workflow ────────────────────────────────────────────────────

/// Counter: change requests accepted by the builder. Labels: kind.
pub const REQUESTS_CREATED_TOTAL: &str = "tutorflow_change_requests_created_total";

/// Counter: change-request transitions. Labels: outcome (new status, or `invalid_state`).
pub const REQUEST_TRANSITIONS_TOTAL: &str = "tutorflow_change_request_transitions_total";

/// Counter: approvals refused by the conflict re-check.
pub const APPROVAL_CONFLICTS_TOTAL: &str = "tutorflow_approval_conflicts_total";

/// Counter: escalations. Labels: trigger (`deadline` or `manual`).
pub const ESCALATIONS_TOTAL: &str = "tutorflow_escalations_total";

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

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertRoom(_) => "insert_room",
        Command::SelectRooms(_) => "select_rooms",
        Command::InsertAvailability { .. } => "insert_availability",
        Command::InsertSessions(_) => "insert_sessions",
        Command::InsertSessionStatus { .. } => "insert_session_status",
        Command::SelectSessions(_) => "select_sessions",
        Command::InsertChangeRequest(_) => "insert_change_request",
        Command::SelectChangeRequests(_) => "select_change_requests",
        Command::InsertReview(_) => "insert_review",
        Command::InsertClarificationResponse { .. } => "insert_clarification_response",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectOptimizationPlan { .. } => "select_optimization_plan",
    }
}
