use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use crate::catalog::{CatalogCache, CatalogError};
use crate::engine::{Engine, EngineError};
use crate::limits::*;
use crate::model::*;
use crate::observability::{HOLD_REQUESTS_TOTAL, hold_error_label};
use crate::slot::{Slot, SlotKey};

#[derive(Debug, thiserror::Error)]
pub enum HoldError {
    #[error("slot already taken ({status})")]
    SlotTaken { status: ReservationStatus },
    #[error("hold is no longer active")]
    StaleHold,
    #[error("outside the complex's opening hours")]
    OutOfHours,
    #[error("slot starts in the past")]
    InThePast,
    #[error("unknown field: {0}")]
    UnknownField(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("payment processor unavailable: {0}")]
    ProcessorUnavailable(String),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("store: {0}")]
    Store(EngineError),
}

impl From<EngineError> for HoldError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::SlotTaken { status, .. } => HoldError::SlotTaken { status },
            EngineError::StaleHold(_) => HoldError::StaleHold,
            other => HoldError::Store(other),
        }
    }
}

/// A customer's request for one slot.
#[derive(Debug, Clone, Deserialize)]
pub struct HoldRequest {
    pub complex_id: String,
    pub field: String,
    pub date: NaiveDate,
    #[serde(with = "crate::catalog::hhmm")]
    pub time: NaiveTime,
    pub customer: CustomerInfo,
    /// Defaults to the field's configured deposit.
    #[serde(default)]
    pub deposit_cents: Option<u64>,
}

/// A slot descriptor as typed by a client, before catalog resolution.
#[derive(Debug, Clone, Deserialize)]
pub struct SlotQuery {
    pub complex_id: String,
    pub field: String,
    pub date: NaiveDate,
    #[serde(with = "crate::catalog::hhmm")]
    pub time: NaiveTime,
}

/// A granted hold.
#[derive(Debug, Clone)]
pub struct HoldGrant {
    pub reservation: Reservation,
    pub complex_name: String,
    pub field_name: String,
}

impl HoldGrant {
    pub fn slot(&self) -> &SlotKey {
        &self.reservation.slot
    }

    pub fn deadline(&self) -> Ms {
        self.reservation.hold_deadline.unwrap_or(self.reservation.created_at)
    }
}

/// Owns the hold lifecycle: validation against the catalog, the exclusive
/// claim in the store, and the TTL.
pub struct HoldManager {
    engine: Arc<Engine>,
    catalog: CatalogCache,
    ttl: Ms,
    offset: FixedOffset,
}

impl HoldManager {
    pub fn new(engine: Arc<Engine>, catalog: CatalogCache, ttl_minutes: u32, offset: FixedOffset) -> Self {
        let ttl_minutes = ttl_minutes.clamp(1, MAX_HOLD_TTL_MINUTES);
        Self {
            engine,
            catalog,
            ttl: ttl_minutes as Ms * MINUTE_MS,
            offset,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub async fn request_hold(&self, req: HoldRequest) -> Result<HoldGrant, HoldError> {
        self.request_hold_at(req, Utc::now()).await
    }

    pub async fn request_hold_at(&self, req: HoldRequest, now: DateTime<Utc>) -> Result<HoldGrant, HoldError> {
        let result = self.place_hold(req, now).await;
        let label = match &result {
            Ok(_) => "granted",
            Err(e) => hold_error_label(e),
        };
        metrics::counter!(HOLD_REQUESTS_TOTAL, "result" => label).increment(1);
        result
    }

    async fn place_hold(&self, req: HoldRequest, now: DateTime<Utc>) -> Result<HoldGrant, HoldError> {
        validate_customer(&req.customer)?;
        let catalog = self.catalog.get().await?;
        let complex = catalog
            .complex(&req.complex_id)
            .ok_or_else(|| HoldError::UnknownField(format!("{}/{}", req.complex_id, req.field)))?;
        let field = complex
            .field(&req.field)
            .ok_or_else(|| HoldError::UnknownField(req.field.clone()))?;

        if self.starts_before(req.date, req.time, now) {
            return Err(HoldError::InThePast);
        }
        if !complex.hours.is_open(req.date, req.time) {
            return Err(HoldError::OutOfHours);
        }

        let deposit_cents = req.deposit_cents.unwrap_or(field.deposit_cents);
        if deposit_cents == 0 {
            return Err(HoldError::InvalidRequest("deposit must be positive".into()));
        }

        let slot = Slot::new(&complex.id, &field.name, req.date, req.time).key();
        let now_ms = now.timestamp_millis();
        let reservation = self
            .engine
            .try_create_hold(slot, now_ms + self.ttl, req.customer, deposit_cents, now_ms)
            .await?;

        info!("hold {} on {}", reservation.id, reservation.slot);
        Ok(HoldGrant {
            reservation,
            complex_name: complex.name.clone(),
            field_name: field.name.clone(),
        })
    }

    /// Whether the slot can be held right now. A stale hold found on the way
    /// is released.
    pub async fn check_availability(&self, query: &SlotQuery) -> Result<(SlotKey, bool), HoldError> {
        self.check_availability_at(query, Utc::now()).await
    }

    pub async fn check_availability_at(
        &self,
        query: &SlotQuery,
        now: DateTime<Utc>,
    ) -> Result<(SlotKey, bool), HoldError> {
        let slot = self.resolve(query).await?;
        let now_ms = now.timestamp_millis();
        let view = self.engine.check_slot(&slot, now_ms).await;
        if view == SlotView::FreeStaleHold && self.engine.release_if_expired(&slot, now_ms).await? {
            debug!("released stale hold on {slot} during read");
        }
        Ok((slot, view.is_free()))
    }

    /// Canonical key for a client-typed slot descriptor.
    pub async fn resolve(&self, query: &SlotQuery) -> Result<SlotKey, HoldError> {
        let catalog = self.catalog.get().await?;
        let field = catalog
            .complex(&query.complex_id)
            .and_then(|c| c.field(&query.field))
            .ok_or_else(|| HoldError::UnknownField(query.field.clone()))?;
        Ok(Slot::new(&query.complex_id, &field.name, query.date, query.time).key())
    }

    /// Slot start in UTC, interpreting date/time in the installation's offset.
    fn starts_before(&self, date: NaiveDate, time: NaiveTime, now: DateTime<Utc>) -> bool {
        match self.offset.from_local_datetime(&date.and_time(time)).single() {
            Some(start) => start.with_timezone(&Utc) < now,
            None => true,
        }
    }
}

fn validate_customer(customer: &CustomerInfo) -> Result<(), HoldError> {
    let name = customer.name.trim();
    if name.is_empty() {
        return Err(HoldError::InvalidRequest("customer name is required".into()));
    }
    if name.len() > MAX_CUSTOMER_NAME_LEN {
        return Err(HoldError::InvalidRequest("customer name too long".into()));
    }
    if customer.phone.len() > MAX_PHONE_LEN {
        return Err(HoldError::InvalidRequest("phone too long".into()));
    }
    Ok(())
}
