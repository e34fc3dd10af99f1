use std::net::SocketAddr;

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: lifecycle commands executed. Labels: command, status.
pub const COMMANDS_TOTAL: &str = "toolshed_commands_total";

/// Histogram: command latency in seconds. Labels: command.
pub const COMMAND_DURATION_SECONDS: &str = "toolshed_command_duration_seconds";

/// Counter: swallowed side-effect failures. Labels: effect.
pub const SIDE_EFFECT_FAILURES_TOTAL: &str = "toolshed_side_effect_failures_total";

/// Counter: wire requests received. Labels: request.
pub const REQUESTS_TOTAL: &str = "toolshed_requests_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "toolshed_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "toolshed_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "toolshed_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "toolshed_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "toolshed_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op without a port.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for a wire request.
pub fn request_label(req: &Request) -> &'static str {
    match req {
        Request::CreateReservation { .. } => "create_reservation",
        Request::Reschedule { .. } => "reschedule",
        Request::Approve { .. } => "approve",
        Request::Decline { .. } => "decline",
        Request::Cancel { .. } => "cancel",
        Request::ConfirmPickup { .. } => "confirm_pickup",
        Request::ConfirmReturn { .. } => "confirm_return",
        Request::RecordPhoto { .. } => "record_photo",
        Request::CreateReview { .. } => "create_review",
        Request::GetReservation { .. } => "get_reservation",
        Request::ListToolReservations { .. } => "list_tool_reservations",
        Request::ListMyReservations => "list_my_reservations",
        Request::BookedRanges { .. } => "booked_ranges",
        Request::ListPhotos { .. } => "list_photos",
        Request::ListReviews { .. } => "list_reviews",
        Request::Reputation { .. } => "reputation",
        Request::Notifications => "notifications",
        Request::MarkRead { .. } => "mark_read",
        Request::Listen => "listen",
        Request::Unlisten => "unlisten",
    }
}
