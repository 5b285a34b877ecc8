//! The payment processor as seen from here: a black box that opens an intent
//! and later reports an outcome.

pub mod bridge;
pub mod credentials;
pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::Verdict;

pub use bridge::{IntentBridge, OpenedIntent};
pub use credentials::{
    Credential, CredentialChain, CredentialError, CredentialLoader, CredentialSet, CredentialSource,
    FileCredentialLoader, StaticCredentials,
};
pub use http::HttpProcessor;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessorError {
    #[error("processor rejected the credential")]
    Unauthorized,
    #[error("processor has no such object")]
    NotFound,
    #[error("processor unavailable: {0}")]
    Unavailable(String),
    #[error("unexpected processor response: {0}")]
    InvalidResponse(String),
}

/// Stamped on every intent so an outcome can find its way back to the slot
/// without any local index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentMetadata {
    pub slot_key: String,
    pub complex_id: String,
    #[serde(default)]
    pub reservation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentRequest {
    pub title: String,
    pub amount_cents: u64,
    pub metadata: IntentMetadata,
    /// Where the processor should post notifications.
    pub notification_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedIntent {
    pub intent_id: String,
    /// Where the customer goes to pay.
    pub redirect_url: String,
}

/// Authoritative payment state as fetched from the processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentOutcome {
    pub payment_id: String,
    /// Raw processor status, kept for logging.
    pub status: String,
    pub verdict: Verdict,
    pub intent_id: Option<String>,
    pub metadata: Option<IntentMetadata>,
}

/// Collapse a processor status into a verdict. Anything unrecognised is
/// treated as still in process.
pub fn verdict_for_status(status: &str) -> Verdict {
    match status {
        "approved" => Verdict::Approved,
        "rejected" | "cancelled" | "refunded" | "charged_back" => Verdict::Rejected,
        _ => Verdict::InProcess,
    }
}

#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn create_intent(
        &self,
        credential: &Credential,
        request: &IntentRequest,
    ) -> Result<CreatedIntent, ProcessorError>;

    async fn fetch_payment(
        &self,
        credential: &Credential,
        payment_id: &str,
    ) -> Result<PaymentOutcome, ProcessorError>;
}
