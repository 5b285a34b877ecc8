mod error;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{info, warn};

use crate::model::*;
use crate::notify::NotifyHub;
use crate::slot::SlotKey;
use crate::wal::Wal;

/// Everything stored for one slot. `reservation` is the single row the
/// uniqueness constraint allows.
#[derive(Debug)]
pub struct SlotState {
    pub key: SlotKey,
    pub reservation: Option<Reservation>,
}

pub type SharedSlotState = Arc<RwLock<SlotState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL. Blocks for the first append, drains
/// whatever else is already queued, and commits the batch with one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                // commit what we have before compacting or reporting counts
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after an append error so half-buffered bytes don't leak
    // into the next batch.
    let flushed = wal.flush_sync();
    let result = result.and(flushed);

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// The availability store: one row per slot at most, every change durable
/// in the WAL before it becomes visible.
pub struct Engine {
    pub(super) slots: DashMap<SlotKey, SharedSlotState>,
    /// External intent id → where it was opened.
    pub(super) intents: DashMap<String, IntentRef>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold it shared, compaction holds it exclusive from snapshot
    /// to swap, so no commit can fall between the two. Always taken before
    /// any slot lock.
    pub(super) commit_gate: RwLock<()>,
    pub notify: Arc<NotifyHub>,
}

/// Apply an event to a slot (no locking; caller holds the slot's lock).
fn apply_to_slot(state: &mut SlotState, event: &Event, intents: &DashMap<String, IntentRef>) {
    match event {
        Event::HoldPlaced {
            id,
            slot,
            deadline,
            customer,
            deposit_cents,
            created_at,
        } => {
            state.reservation = Some(Reservation {
                id: *id,
                slot: slot.clone(),
                status: ReservationStatus::Hold,
                hold_deadline: Some(*deadline),
                customer: customer.clone(),
                deposit_cents: *deposit_cents,
                external_intent_id: None,
                external_payment_id: None,
                created_at: *created_at,
            });
        }
        Event::IntentAttached { intent, .. } => {
            if let Some(r) = state.reservation.as_mut()
                && r.id == intent.reservation_id
            {
                r.status = ReservationStatus::Pending;
                r.hold_deadline = None;
                r.external_intent_id = Some(intent.intent_id.clone());
            }
            intents.insert(intent.intent_id.clone(), intent.clone());
        }
        Event::PaymentPending { payment_id, .. } => {
            if let Some(r) = state.reservation.as_mut() {
                r.status = ReservationStatus::Pending;
                r.hold_deadline = None;
                r.external_payment_id = Some(payment_id.clone());
            }
        }
        Event::PaymentApproved { payment_id, .. } => {
            if let Some(r) = state.reservation.as_mut() {
                r.status = ReservationStatus::Approved;
                r.hold_deadline = None;
                r.external_payment_id = Some(payment_id.clone());
            }
        }
        Event::ApprovalMaterialized {
            id,
            slot,
            customer,
            deposit_cents,
            intent_id,
            payment_id,
            created_at,
        } => {
            state.reservation = Some(Reservation {
                id: *id,
                slot: slot.clone(),
                status: ReservationStatus::Approved,
                hold_deadline: None,
                customer: customer.clone(),
                deposit_cents: *deposit_cents,
                external_intent_id: Some(intent_id.clone()),
                external_payment_id: Some(payment_id.clone()),
                created_at: *created_at,
            });
        }
        Event::OwnerReserved {
            id,
            slot,
            status,
            customer,
            created_at,
        } => {
            state.reservation = Some(Reservation {
                id: *id,
                slot: slot.clone(),
                status: *status,
                hold_deadline: None,
                customer: customer.clone(),
                deposit_cents: 0,
                external_intent_id: None,
                external_payment_id: None,
                created_at: *created_at,
            });
        }
        Event::Released { id, .. } => {
            if state.reservation.as_ref().is_some_and(|r| r.id == *id) {
                state.reservation = None;
            }
        }
        Event::ReservationRestored { reservation } => {
            state.reservation = Some(reservation.clone());
        }
        Event::IntentRecorded { intent } => {
            intents.insert(intent.intent_id.clone(), intent.clone());
        }
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        if replay.discarded_tail {
            warn!(
                "discarded truncated tail of {}, keeping {} bytes",
                wal_path.display(),
                replay.valid_len
            );
            Wal::truncate_tail(&wal_path, replay.valid_len)?;
        }
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            slots: DashMap::new(),
            intents: DashMap::new(),
            wal_tx,
            commit_gate: RwLock::new(()),
            notify,
        };

        // We are the sole owner of these Arcs during replay, so try_write
        // always succeeds. Never blocking_write: this runs inside a runtime.
        for event in &replay.events {
            if let Event::IntentRecorded { intent } = event {
                engine.intents.insert(intent.intent_id.clone(), intent.clone());
                continue;
            }
            let state = engine.slot_entry(event.slot());
            let mut guard = state.try_write().expect("replay: uncontended write");
            apply_to_slot(&mut guard, event, &engine.intents);
        }
        engine.prune_empty_slots();

        info!(
            "replayed {} events: {} reservations, {} intent refs",
            replay.events.len(),
            engine.slots.len(),
            engine.intents.len()
        );
        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append, then apply, then notify. Memory only changes once the
    /// event is durable.
    pub(super) async fn persist_and_apply(
        &self,
        state: &mut SlotState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_slot(state, event, &self.intents);
        self.notify.send(state.key.complex_id(), event);
        Ok(())
    }

    pub(super) fn get_slot(&self, key: &SlotKey) -> Option<SharedSlotState> {
        self.slots.get(key).map(|e| e.value().clone())
    }

    /// Get the slot's state, creating an empty one if needed.
    pub(super) fn slot_entry(&self, key: &SlotKey) -> SharedSlotState {
        self.slots
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(RwLock::new(SlotState {
                    key: key.clone(),
                    reservation: None,
                }))
            })
            .clone()
    }

    /// Drop empty slot states nobody else is holding. The shard lock is held
    /// during the check, so no other task can obtain a clone concurrently.
    pub fn prune_empty_slots(&self) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, state| {
            Arc::strong_count(state) > 1
                || state
                    .try_read()
                    .map_or(true, |guard| guard.reservation.is_some())
        });
        before - self.slots.len()
    }
}
