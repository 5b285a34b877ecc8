use std::net::SocketAddr;

use crate::hold::HoldError;
use crate::reconcile::ReconcileOutcome;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: hold requests. Labels: result.
pub const HOLD_REQUESTS_TOTAL: &str = "turnero_hold_requests_total";

/// Counter: processor intent calls. Labels: result.
pub const INTENT_REQUESTS_TOTAL: &str = "turnero_intent_requests_total";

/// Histogram: processor intent call latency in seconds.
pub const INTENT_DURATION_SECONDS: &str = "turnero_intent_duration_seconds";

/// Counter: payment notifications received. Labels: outcome.
pub const NOTIFICATIONS_TOTAL: &str = "turnero_notifications_total";

/// Counter: approved payments with no reservation to land on.
pub const UNRECONCILED_APPROVALS_TOTAL: &str = "turnero_unreconciled_approvals_total";

/// Counter: credential refreshes after an `Unauthorized` response.
pub const CREDENTIAL_REFRESH_TOTAL: &str = "turnero_credential_refresh_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: rows in the store, expired holds included.
pub const RESERVATIONS_STORED: &str = "turnero_reservations_stored";

/// Counter: holds released by the sweeper.
pub const HOLDS_EXPIRED_TOTAL: &str = "turnero_holds_expired_total";

/// Counter: WAL compactions. Labels: status.
pub const WAL_COMPACTIONS_TOTAL: &str = "turnero_wal_compactions_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "turnero_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "turnero_wal_flush_batch_size";

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

/// Short label for a hold failure.
pub fn hold_error_label(err: &HoldError) -> &'static str {
    match err {
        HoldError::SlotTaken { .. } => "slot_taken",
        HoldError::StaleHold => "stale_hold",
        HoldError::OutOfHours => "out_of_hours",
        HoldError::InThePast => "in_the_past",
        HoldError::UnknownField(_) => "unknown_field",
        HoldError::InvalidRequest(_) => "invalid_request",
        HoldError::ProcessorUnavailable(_) => "processor_unavailable",
        HoldError::Catalog(_) => "catalog",
        HoldError::Store(_) => "store",
    }
}

/// Short label for a reconciliation result.
pub fn reconcile_label(outcome: &ReconcileOutcome) -> &'static str {
    match outcome {
        ReconcileOutcome::Applied(applied) => match applied {
            crate::model::Applied::Approved => "approved",
            crate::model::Applied::AlreadyApproved => "already_approved",
            crate::model::Applied::MarkedPending => "pending",
            crate::model::Applied::AlreadyPending => "already_pending",
            crate::model::Applied::StaleIgnored => "stale_ignored",
            crate::model::Applied::Released => "released",
            crate::model::Applied::NoMatch => "no_match",
        },
        ReconcileOutcome::Materialized => "materialized",
        ReconcileOutcome::Unreconciled => "unreconciled",
        ReconcileOutcome::UnknownSlot => "unknown_slot",
        ReconcileOutcome::Ignored => "ignored",
        ReconcileOutcome::Malformed => "malformed",
        ReconcileOutcome::FetchFailed => "fetch_failed",
        ReconcileOutcome::StoreFailed => "store_failed",
    }
}
