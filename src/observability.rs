use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotd_query_duration_seconds";

/// Counter: statements the SQL front end could not parse.
pub const PARSE_ERRORS_TOTAL: &str = "slotd_parse_errors_total";

/// Counter: committed engine mutations. Labels: op.
pub const ENGINE_OPERATIONS_TOTAL: &str = "slotd_engine_operations_total";

/// Counter: requests that touched another user's slot.
pub const OWNERSHIP_VIOLATIONS_TOTAL: &str = "slotd_ownership_violations_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotd_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotd_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "slotd_wal_compactions_total";

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
        Command::InsertUser { .. } => "insert_user",
        Command::SelectUsers { .. } => "select_users",
        Command::InsertSlot { .. } => "insert_slot",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectSlot { .. } => "select_slot",
        Command::RescheduleSlot { .. } => "reschedule_slot",
        Command::SetSlotStatus { .. } => "set_slot_status",
        Command::DeleteSlot { .. } => "delete_slot",
        Command::InsertMeeting { .. } => "insert_meeting",
        Command::SelectFreeBusy { .. } => "select_free_busy",
        Command::SelectBuckets { .. } => "select_buckets",
    }
}
