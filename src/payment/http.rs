//! Processor client speaking the Mercado Pago checkout API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;

use super::*;

pub struct HttpProcessor {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct PreferenceResponse {
    id: String,
    #[serde(default)]
    init_point: Option<String>,
    #[serde(default)]
    sandbox_init_point: Option<String>,
}

#[derive(Deserialize)]
struct PaymentResponse {
    id: serde_json::Value,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    preference_id: Option<String>,
    #[serde(default)]
    external_reference: Option<String>,
    #[serde(default)]
    metadata: Option<PaymentMetadata>,
}

#[derive(Deserialize, Default)]
struct PaymentMetadata {
    #[serde(default)]
    slot_key: Option<String>,
    #[serde(default)]
    complex_id: Option<String>,
    #[serde(default)]
    reservation_id: Option<String>,
    #[serde(default)]
    preference_id: Option<String>,
}

impl HttpProcessor {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ProcessorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProcessorError::Unavailable(e.to_string()))?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Map a non-2xx status onto the collaborator's error kinds.
    /// `{base}/v1/payments/{id}` with the id encoded as a single segment.
    fn payment_url(&self, payment_id: &str) -> Result<reqwest::Url, ProcessorError> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| ProcessorError::Unavailable(format!("bad processor url: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| ProcessorError::Unavailable("processor url cannot take a path".into()))?
            .pop_if_empty()
            .extend(["v1", "payments", payment_id]);
        Ok(url)
    }

    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ProcessorError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProcessorError::Unauthorized,
            StatusCode::NOT_FOUND => ProcessorError::NotFound,
            s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                ProcessorError::Unavailable(format!("status {}", s.as_u16()))
            }
            s => {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "<unreadable body>".to_string());
                ProcessorError::InvalidResponse(format!("status {}: {body}", s.as_u16()))
            }
        })
    }
}

fn transport(err: reqwest::Error) -> ProcessorError {
    ProcessorError::Unavailable(err.to_string())
}

fn decode(err: reqwest::Error) -> ProcessorError {
    ProcessorError::InvalidResponse(err.to_string())
}

#[async_trait]
impl PaymentProcessor for HttpProcessor {
    async fn create_intent(
        &self,
        credential: &Credential,
        request: &IntentRequest,
    ) -> Result<CreatedIntent, ProcessorError> {
        let mut body = json!({
            "items": [{
                "title": request.title,
                "quantity": 1,
                "unit_price": request.amount_cents as f64 / 100.0,
            }],
            "metadata": request.metadata,
            "external_reference": request.metadata.reservation_id,
            "auto_return": "approved",
        });
        if let Some(url) = &request.notification_url {
            body["notification_url"] = json!(url);
        }

        let response = self
            .client
            .post(format!("{}/checkout/preferences", self.base_url))
            .bearer_auth(&credential.access_token)
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        let preference: PreferenceResponse = Self::ensure_success(response)
            .await?
            .json()
            .await
            .map_err(decode)?;

        let redirect_url = preference
            .init_point
            .or(preference.sandbox_init_point)
            .ok_or_else(|| ProcessorError::InvalidResponse("preference without init_point".into()))?;
        Ok(CreatedIntent {
            intent_id: preference.id,
            redirect_url,
        })
    }

    async fn fetch_payment(
        &self,
        credential: &Credential,
        payment_id: &str,
    ) -> Result<PaymentOutcome, ProcessorError> {
        let response = self
            .client
            .get(self.payment_url(payment_id)?)
            .bearer_auth(&credential.access_token)
            .send()
            .await
            .map_err(transport)?;
        let payment: PaymentResponse = Self::ensure_success(response)
            .await?
            .json()
            .await
            .map_err(decode)?;
        Ok(payment_outcome(payment))
    }
}

fn payment_outcome(payment: PaymentResponse) -> PaymentOutcome {
    let payment_id = match payment.id {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    };
    let status = payment.status.unwrap_or_default();
    let meta = payment.metadata.unwrap_or_default();
    let intent_id = payment.preference_id.or(meta.preference_id);
    let reservation_id = meta.reservation_id.or(payment.external_reference);
    let metadata = match (meta.slot_key, meta.complex_id) {
        (Some(slot_key), Some(complex_id)) => Some(IntentMetadata {
            slot_key,
            complex_id,
            reservation_id,
        }),
        _ => None,
    };
    PaymentOutcome {
        payment_id,
        verdict: verdict_for_status(&status),
        status,
        intent_id,
        metadata,
    }
}
