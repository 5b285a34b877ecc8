use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::engine::Engine;
use crate::limits::MAX_EXTERNAL_ID_LEN;
use crate::model::*;
use crate::observability::{NOTIFICATIONS_TOTAL, UNRECONCILED_APPROVALS_TOTAL, reconcile_label};
use crate::payment::{CredentialChain, PaymentOutcome, PaymentProcessor};
use crate::slot::SlotKey;

/// What to do with an approved payment whose reservation is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanPolicy {
    /// Recreate the booking as `approved` if the slot is still free.
    Materialize,
    /// Only log and count it; an operator sorts it out.
    Manual,
}

impl FromStr for OrphanPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "materialize" => Ok(OrphanPolicy::Materialize),
            "manual" => Ok(OrphanPolicy::Manual),
            other => Err(format!("unknown orphan approval policy {other:?}")),
        }
    }
}

/// How one notification ended. None of these is an error to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied(Applied),
    /// Approved payment recreated its reservation.
    Materialized,
    /// Approved payment with nowhere to land.
    Unreconciled,
    UnknownSlot,
    /// Not a payment notification.
    Ignored,
    Malformed,
    /// No credential could read the payment.
    FetchFailed,
    StoreFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub payment_id: Option<String>,
    pub slot: Option<SlotKey>,
    pub outcome: ReconcileOutcome,
}

impl ReconcileReport {
    fn new(outcome: ReconcileOutcome) -> Self {
        Self {
            payment_id: None,
            slot: None,
            outcome,
        }
    }
}

impl fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", reconcile_label(&self.outcome))?;
        if let Some(id) = &self.payment_id {
            write!(f, " payment={id}")?;
        }
        if let Some(slot) = &self.slot {
            write!(f, " slot={slot}")?;
        }
        Ok(())
    }
}

/// Applies processor notifications to the store. Safe under duplicate,
/// late and reordered delivery: the outcome is always re-fetched and the
/// store's transitions are idempotent.
pub struct Reconciler {
    engine: Arc<Engine>,
    processor: Arc<dyn PaymentProcessor>,
    credentials: Arc<CredentialChain>,
    policy: OrphanPolicy,
}

impl Reconciler {
    pub fn new(
        engine: Arc<Engine>,
        processor: Arc<dyn PaymentProcessor>,
        credentials: Arc<CredentialChain>,
        policy: OrphanPolicy,
    ) -> Self {
        Self {
            engine,
            processor,
            credentials,
            policy,
        }
    }

    pub async fn apply_notification(&self, raw: &Value) -> ReconcileReport {
        self.apply_notification_at(raw, now_ms()).await
    }

    pub async fn apply_notification_at(&self, raw: &Value, now: Ms) -> ReconcileReport {
        let report = self.reconcile(raw, now).await;
        metrics::counter!(NOTIFICATIONS_TOTAL, "outcome" => reconcile_label(&report.outcome)).increment(1);
        match report.outcome {
            ReconcileOutcome::Unreconciled => {
                metrics::counter!(UNRECONCILED_APPROVALS_TOTAL).increment(1);
                error!("unreconciled approved payment: {report}");
            }
            ReconcileOutcome::StoreFailed => error!("notification not applied: {report}"),
            ReconcileOutcome::FetchFailed | ReconcileOutcome::UnknownSlot => warn!("notification: {report}"),
            ReconcileOutcome::Malformed | ReconcileOutcome::Ignored => debug!("notification: {report}"),
            _ => info!("notification: {report}"),
        }
        report
    }

    async fn reconcile(&self, raw: &Value, now: Ms) -> ReconcileReport {
        if let Some(topic) = notification_topic(raw)
            && topic != "payment"
        {
            return ReconcileReport::new(ReconcileOutcome::Ignored);
        }
        let Some(payment_id) = payment_id(raw) else {
            return ReconcileReport::new(ReconcileOutcome::Malformed);
        };
        let mut report = ReconcileReport {
            payment_id: Some(payment_id.clone()),
            slot: None,
            outcome: ReconcileOutcome::FetchFailed,
        };

        let Some(outcome) = self.fetch_outcome(&payment_id).await else {
            return report;
        };

        let intent = outcome
            .intent_id
            .as_deref()
            .and_then(|id| self.engine.intent_ref(id));
        let Some(slot) = recover_slot(&outcome, intent.as_ref()) else {
            report.outcome = ReconcileOutcome::UnknownSlot;
            return report;
        };
        report.slot = Some(slot.clone());

        let reservation_id = outcome
            .metadata
            .as_ref()
            .and_then(|m| m.reservation_id.as_deref())
            .and_then(|id| Ulid::from_string(id).ok())
            .or(intent.as_ref().map(|i| i.reservation_id));
        let update = OutcomeUpdate {
            payment_id: outcome.payment_id.clone(),
            intent_id: outcome.intent_id.clone(),
            reservation_id,
            verdict: outcome.verdict,
        };

        report.outcome = match self.engine.apply_outcome(&slot, &update).await {
            Ok(Applied::NoMatch) if update.verdict == Verdict::Approved => {
                self.orphan_approval(intent.as_ref(), &slot, &update.payment_id, now)
                    .await
            }
            Ok(applied) => ReconcileOutcome::Applied(applied),
            Err(e) => {
                error!("applying payment {payment_id} to {slot}: {e}");
                ReconcileOutcome::StoreFailed
            }
        };
        report
    }

    /// Try every known credential in chain order until one can read the
    /// payment.
    async fn fetch_outcome(&self, payment_id: &str) -> Option<PaymentOutcome> {
        let candidates = self.credentials.candidates().await;
        if candidates.is_empty() {
            warn!("no credentials configured; cannot fetch payment {payment_id}");
        }
        for credential in &candidates {
            match self.processor.fetch_payment(credential, payment_id).await {
                Ok(outcome) => return Some(outcome),
                Err(e) => debug!(
                    "fetch payment {payment_id} with {} credential failed: {e}",
                    credential.source
                ),
            }
        }
        None
    }

    async fn orphan_approval(
        &self,
        intent: Option<&IntentRef>,
        slot: &SlotKey,
        payment_id: &str,
        now: Ms,
    ) -> ReconcileOutcome {
        if self.policy == OrphanPolicy::Manual {
            return ReconcileOutcome::Unreconciled;
        }
        let Some(intent) = intent.filter(|i| &i.slot == slot) else {
            return ReconcileOutcome::Unreconciled;
        };
        match self.engine.materialize_approved(intent, payment_id, now).await {
            Ok(r) => {
                info!("materialized approved reservation {} on {slot}", r.id);
                ReconcileOutcome::Materialized
            }
            Err(e) if e.is_contention() => {
                warn!("approved payment {payment_id} could not take back {slot}: {e}");
                ReconcileOutcome::Unreconciled
            }
            Err(e) => {
                error!("materializing payment {payment_id} on {slot}: {e}");
                ReconcileOutcome::StoreFailed
            }
        }
    }
}

fn notification_topic(raw: &Value) -> Option<&str> {
    raw.get("type")
        .or_else(|| raw.get("topic"))
        .and_then(Value::as_str)
}

/// `data.id` or `id`, as a string or a number. Only `[A-Za-z0-9_-]` ids
/// are accepted since the id becomes a path segment on fetch.
fn payment_id(raw: &Value) -> Option<String> {
    let value = raw.get("data").and_then(|d| d.get("id")).or_else(|| raw.get("id"))?;
    let id = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    let well_formed = !id.is_empty()
        && id.len() <= MAX_EXTERNAL_ID_LEN
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    well_formed.then_some(id)
}

/// Slot key from the payment's own metadata, else from the intent index.
fn recover_slot(outcome: &PaymentOutcome, intent: Option<&IntentRef>) -> Option<SlotKey> {
    if let Some(meta) = &outcome.metadata {
        match SlotKey::parse(&meta.slot_key) {
            Ok(slot) => return Some(slot),
            Err(e) => warn!("payment {} carries a bad slot key: {e}", outcome.payment_id),
        }
    }
    intent.map(|i| i.slot.clone())
}
