use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::slot::SlotKey;

/// Unix milliseconds. The only time type inside the store.
pub type Ms = i64;

pub fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Lifecycle state of a reservation row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    /// Tentative claim while the customer is sent to pay.
    Hold,
    /// An intent exists; waiting for the processor's verdict.
    Pending,
    /// Deposit paid.
    Approved,
    /// Payment failed. Rows are deleted on failure, so this only shows up
    /// as a release reason.
    Cancelled,
    /// Owner closed the slot.
    Blocked,
    /// Owner booked the slot by hand.
    Manual,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Hold => "hold",
            ReservationStatus::Pending => "pending",
            ReservationStatus::Approved => "approved",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Blocked => "blocked",
            ReservationStatus::Manual => "manual",
        }
    }

    /// Owner-only statuses, inserted directly instead of through a hold.
    pub fn is_owner_status(&self) -> bool {
        matches!(self, ReservationStatus::Blocked | ReservationStatus::Manual)
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerInfo {
    pub name: String,
    pub phone: String,
}

/// A row of the availability table. At most one live row exists per slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub slot: SlotKey,
    pub status: ReservationStatus,
    /// Present only while `status == Hold`.
    pub hold_deadline: Option<Ms>,
    pub customer: CustomerInfo,
    pub deposit_cents: u64,
    pub external_intent_id: Option<String>,
    pub external_payment_id: Option<String>,
    pub created_at: Ms,
}

impl Reservation {
    /// Whether this row still occupies its slot at `now`. Expired holds read
    /// as absent even before the sweeper removes them.
    pub fn is_live(&self, now: Ms) -> bool {
        match self.status {
            ReservationStatus::Hold => self.hold_deadline.is_some_and(|d| d > now),
            ReservationStatus::Cancelled => false,
            _ => true,
        }
    }

    pub fn is_expired_hold(&self, now: Ms) -> bool {
        self.status == ReservationStatus::Hold && !self.is_live(now)
    }
}

/// Index entry mapping an external intent back to the slot it was opened for.
/// Outlives the reservation so late notifications can still be placed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentRef {
    pub intent_id: String,
    pub slot: SlotKey,
    pub complex_id: String,
    pub reservation_id: Ulid,
    pub customer: CustomerInfo,
    pub deposit_cents: u64,
    pub created_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseReason {
    /// Hold deadline passed before an intent was attached.
    Expired,
    /// Processor call failed while opening the intent.
    IntentFailed,
    /// Processor reported a rejected or cancelled payment.
    PaymentRejected,
    /// Owner removed the reservation.
    Owner,
}

/// The event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    HoldPlaced {
        id: Ulid,
        slot: SlotKey,
        deadline: Ms,
        customer: CustomerInfo,
        deposit_cents: u64,
        created_at: Ms,
    },
    IntentAttached {
        slot: SlotKey,
        intent: IntentRef,
    },
    PaymentPending {
        slot: SlotKey,
        payment_id: String,
    },
    PaymentApproved {
        slot: SlotKey,
        payment_id: String,
    },
    /// Approved payment whose hold was already gone; the row is recreated.
    ApprovalMaterialized {
        id: Ulid,
        slot: SlotKey,
        customer: CustomerInfo,
        deposit_cents: u64,
        intent_id: String,
        payment_id: String,
        created_at: Ms,
    },
    OwnerReserved {
        id: Ulid,
        slot: SlotKey,
        status: ReservationStatus,
        customer: CustomerInfo,
        created_at: Ms,
    },
    Released {
        slot: SlotKey,
        id: Ulid,
        reason: ReleaseReason,
    },
    /// Snapshot records written by compaction.
    ReservationRestored {
        reservation: Reservation,
    },
    IntentRecorded {
        intent: IntentRef,
    },
}

impl Event {
    /// Slot touched by this event.
    pub fn slot(&self) -> &SlotKey {
        match self {
            Event::HoldPlaced { slot, .. }
            | Event::IntentAttached { slot, .. }
            | Event::PaymentPending { slot, .. }
            | Event::PaymentApproved { slot, .. }
            | Event::ApprovalMaterialized { slot, .. }
            | Event::OwnerReserved { slot, .. }
            | Event::Released { slot, .. } => slot,
            Event::ReservationRestored { reservation } => &reservation.slot,
            Event::IntentRecorded { intent } => &intent.slot,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// What a read of one slot found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotView {
    Free,
    /// Free, but an expired hold row is still stored and should be released.
    FreeStaleHold,
    Taken(ReservationStatus),
}

impl SlotView {
    pub fn is_free(&self) -> bool {
        !matches!(self, SlotView::Taken(_))
    }
}

/// Payment-driven update handed to the store by reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeUpdate {
    pub payment_id: String,
    pub intent_id: Option<String>,
    pub reservation_id: Option<Ulid>,
    pub verdict: Verdict,
}

/// Processor status collapsed to what the state machine cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Approved,
    Rejected,
    InProcess,
}

/// Result of applying an [`OutcomeUpdate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Transitioned into `approved`; the downstream trigger fired.
    Approved,
    /// Row was already `approved`; nothing changed.
    AlreadyApproved,
    MarkedPending,
    AlreadyPending,
    /// Non-terminal outcome arrived after the terminal one; ignored.
    StaleIgnored,
    /// Terminal failure; the row was deleted.
    Released,
    /// No row for the slot, or the row belongs to another payment.
    NoMatch,
}
