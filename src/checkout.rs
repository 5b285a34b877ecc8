use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use ulid::Ulid;

use crate::hold::{HoldError, HoldGrant, HoldManager, HoldRequest};
use crate::limits::MAX_DESCRIPTION_LEN;
use crate::model::Ms;
use crate::payment::IntentBridge;
use crate::slot::SlotKey;

/// What the customer needs to go and pay.
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutReceipt {
    pub slot_key: SlotKey,
    pub reservation_id: Ulid,
    pub intent_id: String,
    pub redirect_url: String,
    /// When the slot would have been released had no intent been opened.
    pub hold_deadline: Ms,
}

/// Hold the slot, then open the processor intent for it.
pub struct Checkout {
    holds: Arc<HoldManager>,
    bridge: IntentBridge,
}

impl Checkout {
    pub fn new(holds: Arc<HoldManager>, bridge: IntentBridge) -> Self {
        Self { holds, bridge }
    }

    pub fn holds(&self) -> &Arc<HoldManager> {
        &self.holds
    }

    pub async fn start(&self, req: HoldRequest) -> Result<CheckoutReceipt, HoldError> {
        self.start_at(req, Utc::now()).await
    }

    pub async fn start_at(&self, req: HoldRequest, now: DateTime<Utc>) -> Result<CheckoutReceipt, HoldError> {
        let grant = self.holds.request_hold_at(req, now).await?;
        let opened = self
            .bridge
            .open_intent_at(&grant, &describe(&grant), now.timestamp_millis())
            .await?;
        Ok(CheckoutReceipt {
            slot_key: opened.reservation.slot.clone(),
            reservation_id: opened.reservation.id,
            intent_id: opened.intent_id,
            redirect_url: opened.redirect_url,
            hold_deadline: grant.deadline(),
        })
    }
}

/// Line-item title shown on the processor's checkout page.
fn describe(grant: &HoldGrant) -> String {
    let venue = if grant.complex_name.is_empty() {
        grant.slot().complex_id()
    } else {
        grant.complex_name.as_str()
    };
    let when = match grant.slot().slot() {
        Ok(slot) => format!("{} {}", slot.date.format("%d/%m"), slot.time.format("%H:%M")),
        Err(_) => grant.slot().to_string(),
    };
    let mut title = format!("Seña {} - {} {when}", grant.field_name, venue);
    if title.len() > MAX_DESCRIPTION_LEN {
        let mut cut = MAX_DESCRIPTION_LEN;
        while !title.is_char_boundary(cut) {
            cut -= 1;
        }
        title.truncate(cut);
    }
    title
}
