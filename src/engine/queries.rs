use crate::model::*;
use crate::slot::SlotKey;

use super::Engine;

impl Engine {
    /// The live row for a slot, if any. Expired holds read as absent.
    pub async fn get_reservation(&self, slot: &SlotKey, now: Ms) -> Option<Reservation> {
        let state = self.get_slot(slot)?;
        let guard = state.read().await;
        guard.reservation.clone().filter(|r| r.is_live(now))
    }

    pub async fn check_slot(&self, slot: &SlotKey, now: Ms) -> SlotView {
        let Some(state) = self.get_slot(slot) else {
            return SlotView::Free;
        };
        let guard = state.read().await;
        match &guard.reservation {
            None => SlotView::Free,
            Some(r) if r.is_live(now) => SlotView::Taken(r.status),
            Some(_) => SlotView::FreeStaleHold,
        }
    }

    /// Live rows ordered by slot key, optionally limited to one complex.
    pub async fn list_live(&self, now: Ms, complex_id: Option<&str>) -> Vec<Reservation> {
        let states: Vec<_> = self
            .slots
            .iter()
            .filter(|e| complex_id.is_none_or(|c| e.key().complex_id() == c))
            .map(|e| e.value().clone())
            .collect();

        let mut live = Vec::new();
        for state in states {
            let guard = state.read().await;
            if let Some(r) = &guard.reservation
                && r.is_live(now)
            {
                live.push(r.clone());
            }
        }
        live.sort_by(|a, b| a.slot.cmp(&b.slot));
        live
    }

    pub fn intent_ref(&self, intent_id: &str) -> Option<IntentRef> {
        self.intents.get(intent_id).map(|e| e.value().clone())
    }

    /// Keys of stored holds past their deadline. Slots currently locked are
    /// skipped; the next sweep picks them up.
    pub fn collect_expired_holds(&self, now: Ms) -> Vec<SlotKey> {
        let mut expired = Vec::new();
        for entry in self.slots.iter() {
            let Ok(guard) = entry.value().try_read() else {
                continue;
            };
            if guard.reservation.as_ref().is_some_and(|r| r.is_expired_hold(now)) {
                expired.push(entry.key().clone());
            }
        }
        expired
    }

    /// Stored rows, including expired holds not yet swept.
    pub fn stored_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|e| {
                e.value()
                    .try_read()
                    .map_or(true, |guard| guard.reservation.is_some())
            })
            .count()
    }
}
