use tokio::sync::oneshot;
use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::slot::SlotKey;

use super::{Engine, EngineError, SlotState, WalCommand};

impl Engine {
    /// Fail with `SlotTaken` if a live row occupies the slot; release an
    /// expired hold that is still stored. Caller holds the slot's write lock,
    /// so the check and the following insert are one atomic step.
    async fn claim_vacancy(&self, state: &mut SlotState, now: Ms) -> Result<(), EngineError> {
        let Some(existing) = &state.reservation else {
            return Ok(());
        };
        if existing.is_live(now) {
            return Err(EngineError::SlotTaken {
                slot: state.key.clone(),
                status: existing.status,
            });
        }
        let event = Event::Released {
            slot: state.key.clone(),
            id: existing.id,
            reason: ReleaseReason::Expired,
        };
        self.persist_and_apply(state, &event).await
    }

    fn check_capacity(&self) -> Result<(), EngineError> {
        if self.slots.len() >= MAX_LIVE_RESERVATIONS {
            return Err(EngineError::LimitExceeded("too many reservations"));
        }
        Ok(())
    }

    /// Insert a `hold` row iff no live row exists for the slot.
    pub async fn try_create_hold(
        &self,
        slot: SlotKey,
        deadline: Ms,
        customer: CustomerInfo,
        deposit_cents: u64,
        now: Ms,
    ) -> Result<Reservation, EngineError> {
        if deadline <= now {
            return Err(EngineError::LimitExceeded("hold deadline already passed"));
        }
        self.check_capacity()?;
        let _gate = self.commit_gate.read().await;
        let state = self.slot_entry(&slot);
        let mut guard = state.write().await;
        self.claim_vacancy(&mut guard, now).await?;

        let event = Event::HoldPlaced {
            id: Ulid::new(),
            slot: slot.clone(),
            deadline,
            customer,
            deposit_cents,
            created_at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        guard.reservation.clone().ok_or(EngineError::NotFound(slot))
    }

    /// hold → pending. Only the exact hold the intent was opened for, and
    /// only while it is still live.
    pub async fn attach_intent(&self, intent: IntentRef, now: Ms) -> Result<Reservation, EngineError> {
        let stale = || EngineError::StaleHold(intent.slot.clone());
        let _gate = self.commit_gate.read().await;
        let state = self.get_slot(&intent.slot).ok_or_else(stale)?;
        let mut guard = state.write().await;
        let current = guard.reservation.as_ref().ok_or_else(stale)?;
        if current.id != intent.reservation_id
            || current.status != ReservationStatus::Hold
            || !current.is_live(now)
        {
            return Err(stale());
        }

        let slot = intent.slot.clone();
        let event = Event::IntentAttached { slot: slot.clone(), intent };
        self.persist_and_apply(&mut guard, &event).await?;
        guard.reservation.clone().ok_or(EngineError::NotFound(slot))
    }

    /// Delete a specific hold (e.g. the processor call failed). Returns false
    /// if the row is gone or no longer that hold.
    pub async fn release_hold(
        &self,
        slot: &SlotKey,
        reservation_id: Ulid,
        reason: ReleaseReason,
    ) -> Result<bool, EngineError> {
        let _gate = self.commit_gate.read().await;
        let Some(state) = self.get_slot(slot) else {
            return Ok(false);
        };
        let mut guard = state.write().await;
        let is_that_hold = guard
            .reservation
            .as_ref()
            .is_some_and(|r| r.id == reservation_id && r.status == ReservationStatus::Hold);
        if !is_that_hold {
            return Ok(false);
        }
        let event = Event::Released {
            slot: slot.clone(),
            id: reservation_id,
            reason,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(true)
    }

    /// Delete the row only if it is still a hold whose deadline has passed.
    /// Safe against a hold that was converted to pending a moment ago.
    pub async fn release_if_expired(&self, slot: &SlotKey, now: Ms) -> Result<bool, EngineError> {
        let _gate = self.commit_gate.read().await;
        let Some(state) = self.get_slot(slot) else {
            return Ok(false);
        };
        let mut guard = state.write().await;
        let expired_id = match &guard.reservation {
            Some(r) if r.is_expired_hold(now) => r.id,
            _ => return Ok(false),
        };
        let event = Event::Released {
            slot: slot.clone(),
            id: expired_id,
            reason: ReleaseReason::Expired,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(true)
    }

    /// Apply an authoritative payment outcome to the slot's row.
    ///
    /// Terminal states are sticky: `approved` is never downgraded by a later
    /// in-process outcome; only a rejection of the approving payment itself
    /// releases it. Repeated outcomes
    /// produce no new events.
    pub async fn apply_outcome(&self, slot: &SlotKey, update: &OutcomeUpdate) -> Result<Applied, EngineError> {
        let _gate = self.commit_gate.read().await;
        let Some(state) = self.get_slot(slot) else {
            return Ok(Applied::NoMatch);
        };
        let mut guard = state.write().await;
        let Some(current) = guard.reservation.as_ref() else {
            return Ok(Applied::NoMatch);
        };
        if !outcome_matches(current, update) {
            debug!(
                "outcome for payment {} does not match reservation {} on {slot}",
                update.payment_id, current.id
            );
            return Ok(Applied::NoMatch);
        }

        let status = current.status;
        let same_payment = current.external_payment_id.as_deref() == Some(update.payment_id.as_str());
        let reservation_id = current.id;

        let (event, applied) = match update.verdict {
            Verdict::Approved if status == ReservationStatus::Approved => {
                return Ok(Applied::AlreadyApproved);
            }
            Verdict::Approved => (
                Event::PaymentApproved {
                    slot: slot.clone(),
                    payment_id: update.payment_id.clone(),
                },
                Applied::Approved,
            ),
            Verdict::InProcess if status == ReservationStatus::Approved => {
                return Ok(Applied::StaleIgnored);
            }
            Verdict::InProcess if status == ReservationStatus::Pending && same_payment => {
                return Ok(Applied::AlreadyPending);
            }
            Verdict::InProcess => (
                Event::PaymentPending {
                    slot: slot.clone(),
                    payment_id: update.payment_id.clone(),
                },
                Applied::MarkedPending,
            ),
            // only the payment that approved the row can take it back
            Verdict::Rejected if status == ReservationStatus::Approved && !same_payment => {
                return Ok(Applied::StaleIgnored);
            }
            Verdict::Rejected => (
                Event::Released {
                    slot: slot.clone(),
                    id: reservation_id,
                    reason: ReleaseReason::PaymentRejected,
                },
                Applied::Released,
            ),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(applied)
    }

    /// Recreate an approved booking whose row is gone, through the same
    /// conditional insert as a hold.
    pub async fn materialize_approved(
        &self,
        intent: &IntentRef,
        payment_id: &str,
        now: Ms,
    ) -> Result<Reservation, EngineError> {
        self.check_capacity()?;
        let _gate = self.commit_gate.read().await;
        let state = self.slot_entry(&intent.slot);
        let mut guard = state.write().await;
        self.claim_vacancy(&mut guard, now).await?;

        let event = Event::ApprovalMaterialized {
            id: intent.reservation_id,
            slot: intent.slot.clone(),
            customer: intent.customer.clone(),
            deposit_cents: intent.deposit_cents,
            intent_id: intent.intent_id.clone(),
            payment_id: payment_id.to_string(),
            created_at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        guard
            .reservation
            .clone()
            .ok_or_else(|| EngineError::NotFound(intent.slot.clone()))
    }

    /// Owner-side direct insertion of a `manual` or `blocked` row. Obeys the
    /// same uniqueness rule as holds.
    pub async fn reserve_direct(
        &self,
        slot: SlotKey,
        status: ReservationStatus,
        customer: CustomerInfo,
        now: Ms,
    ) -> Result<Reservation, EngineError> {
        if !status.is_owner_status() {
            return Err(EngineError::InvalidStatus(status));
        }
        self.check_capacity()?;
        let _gate = self.commit_gate.read().await;
        let state = self.slot_entry(&slot);
        let mut guard = state.write().await;
        self.claim_vacancy(&mut guard, now).await?;

        let event = Event::OwnerReserved {
            id: Ulid::new(),
            slot: slot.clone(),
            status,
            customer,
            created_at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        guard.reservation.clone().ok_or(EngineError::NotFound(slot))
    }

    /// Owner-side removal of whatever row occupies the slot.
    pub async fn cancel_reservation(&self, slot: &SlotKey) -> Result<Reservation, EngineError> {
        let _gate = self.commit_gate.read().await;
        let state = self
            .get_slot(slot)
            .ok_or_else(|| EngineError::NotFound(slot.clone()))?;
        let mut guard = state.write().await;
        let removed = guard
            .reservation
            .clone()
            .ok_or_else(|| EngineError::NotFound(slot.clone()))?;
        let event = Event::Released {
            slot: slot.clone(),
            id: removed.id,
            reason: ReleaseReason::Owner,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(removed)
    }

    /// Rewrite the WAL as a snapshot: current rows plus intent references
    /// younger than `intent_retention`. Older references are forgotten.
    /// Commits wait until the snapshot has replaced the log.
    pub async fn compact_wal(&self, now: Ms, intent_retention: Ms) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let cutoff = now - intent_retention;
        self.intents.retain(|_, intent| intent.created_at >= cutoff);
        self.prune_empty_slots();

        let mut events = Vec::new();
        let states: Vec<_> = self.slots.iter().map(|e| e.value().clone()).collect();
        for state in states {
            let guard = state.read().await;
            if let Some(reservation) = &guard.reservation {
                events.push(Event::ReservationRestored {
                    reservation: reservation.clone(),
                });
            }
        }
        for entry in self.intents.iter() {
            events.push(Event::IntentRecorded {
                intent: entry.value().clone(),
            });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// An outcome belongs to a row when any of the ids we stamped agree.
fn outcome_matches(current: &Reservation, update: &OutcomeUpdate) -> bool {
    let by_intent = update
        .intent_id
        .as_deref()
        .is_some_and(|id| current.external_intent_id.as_deref() == Some(id));
    let by_payment = current.external_payment_id.as_deref() == Some(update.payment_id.as_str());
    let by_reservation = update.reservation_id == Some(current.id);
    by_intent || by_payment || by_reservation
}
