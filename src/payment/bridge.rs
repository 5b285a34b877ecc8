use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use super::*;
use crate::engine::{Engine, EngineError};
use crate::hold::{HoldError, HoldGrant};
use crate::model::{IntentRef, Ms, ReleaseReason, Reservation, now_ms};
use crate::observability::{INTENT_DURATION_SECONDS, INTENT_REQUESTS_TOTAL};

/// An intent opened for a held slot.
#[derive(Debug, Clone)]
pub struct OpenedIntent {
    pub intent_id: String,
    pub redirect_url: String,
    /// The row, now `pending`.
    pub reservation: Reservation,
}

/// Opens a processor intent for a held slot and records it in the store.
/// No store lock is held while the processor is being called.
pub struct IntentBridge {
    engine: Arc<Engine>,
    processor: Arc<dyn PaymentProcessor>,
    credentials: Arc<CredentialChain>,
    timeout: Duration,
    notification_url: Option<String>,
}

impl IntentBridge {
    pub fn new(
        engine: Arc<Engine>,
        processor: Arc<dyn PaymentProcessor>,
        credentials: Arc<CredentialChain>,
        timeout: Duration,
        notification_url: Option<String>,
    ) -> Self {
        Self {
            engine,
            processor,
            credentials,
            timeout,
            notification_url,
        }
    }

    pub async fn open_intent(&self, grant: &HoldGrant, description: &str) -> Result<OpenedIntent, HoldError> {
        self.open_intent_at(grant, description, now_ms()).await
    }

    pub async fn open_intent_at(
        &self,
        grant: &HoldGrant,
        description: &str,
        now: Ms,
    ) -> Result<OpenedIntent, HoldError> {
        let hold = &grant.reservation;
        let complex_id = hold.slot.complex_id().to_string();
        let request = IntentRequest {
            title: description.to_string(),
            amount_cents: hold.deposit_cents,
            metadata: IntentMetadata {
                slot_key: hold.slot.to_string(),
                complex_id: complex_id.clone(),
                reservation_id: Some(hold.id.to_string()),
            },
            notification_url: self.notification_url.clone(),
        };

        let created = match self.create_with_refresh(&complex_id, &request).await {
            Ok(created) => created,
            Err(reason) => {
                metrics::counter!(INTENT_REQUESTS_TOTAL, "result" => "failed").increment(1);
                warn!("intent for {} failed: {reason}", hold.slot);
                self.release(hold).await;
                return Err(HoldError::ProcessorUnavailable(reason));
            }
        };
        metrics::counter!(INTENT_REQUESTS_TOTAL, "result" => "created").increment(1);

        let intent = IntentRef {
            intent_id: created.intent_id.clone(),
            slot: hold.slot.clone(),
            complex_id,
            reservation_id: hold.id,
            customer: hold.customer.clone(),
            deposit_cents: hold.deposit_cents,
            created_at: now,
        };
        match self.engine.attach_intent(intent, now).await {
            Ok(reservation) => {
                info!("intent {} attached to {}", created.intent_id, reservation.slot);
                Ok(OpenedIntent {
                    intent_id: created.intent_id,
                    redirect_url: created.redirect_url,
                    reservation,
                })
            }
            Err(EngineError::StaleHold(slot)) => {
                // The intent exists at the processor but points at nothing.
                warn!("hold on {slot} went stale while intent {} was opened", created.intent_id);
                Err(HoldError::StaleHold)
            }
            Err(e) => {
                error!("recording intent {} failed: {e}", created.intent_id);
                self.release(hold).await;
                Err(e.into())
            }
        }
    }

    /// One attempt, then on `Unauthorized` exactly one credential refresh and
    /// a second attempt. Every failure collapses into a reason string.
    async fn create_with_refresh(&self, complex_id: &str, request: &IntentRequest) -> Result<CreatedIntent, String> {
        match self.attempt(complex_id, request).await {
            Err(ProcessorError::Unauthorized) => {
                info!("processor rejected credential for {complex_id}, refreshing");
                self.credentials.refresh().await.map_err(|e| e.to_string())?;
                self.attempt(complex_id, request).await.map_err(|e| e.to_string())
            }
            other => other.map_err(|e| e.to_string()),
        }
    }

    async fn attempt(&self, complex_id: &str, request: &IntentRequest) -> Result<CreatedIntent, ProcessorError> {
        let credential = self
            .credentials
            .for_complex(complex_id)
            .await
            .map_err(|e| ProcessorError::Unavailable(e.to_string()))?;
        let started = Instant::now();
        let result = tokio::time::timeout(self.timeout, self.processor.create_intent(&credential, request))
            .await
            .unwrap_or_else(|_| Err(ProcessorError::Unavailable("timed out".into())));
        metrics::histogram!(INTENT_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        result
    }

    async fn release(&self, hold: &Reservation) {
        if let Err(e) = self
            .engine
            .release_hold(&hold.slot, hold.id, ReleaseReason::IntentFailed)
            .await
        {
            error!("could not release hold {} on {}: {e}", hold.id, hold.slot);
        }
    }
}
