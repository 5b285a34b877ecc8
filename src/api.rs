use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::checkout::{Checkout, CheckoutReceipt};
use crate::engine::Engine;
use crate::hold::{HoldError, HoldRequest, SlotQuery};
use crate::model::now_ms;
use crate::reconcile::Reconciler;
use crate::slot::SlotKey;

#[derive(Clone)]
pub struct AppState {
    pub checkout: Arc<Checkout>,
    pub reconciler: Arc<Reconciler>,
}

impl AppState {
    fn engine(&self) -> &Arc<Engine> {
        self.checkout.holds().engine()
    }
}

#[derive(Debug)]
pub enum ApiError {
    Hold(HoldError),
    BadRequest(String),
}

impl From<HoldError> for ApiError {
    fn from(err: HoldError) -> Self {
        ApiError::Hold(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_request", msg),
            ApiError::Hold(err) => {
                let status = match &err {
                    HoldError::SlotTaken { .. } | HoldError::StaleHold => StatusCode::CONFLICT,
                    HoldError::OutOfHours | HoldError::InThePast | HoldError::InvalidRequest(_) => {
                        StatusCode::UNPROCESSABLE_ENTITY
                    }
                    HoldError::UnknownField(_) => StatusCode::NOT_FOUND,
                    HoldError::ProcessorUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                    HoldError::Catalog(_) | HoldError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let code = crate::observability::hold_error_label(&err);
                let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
                    error!("internal error: {err}");
                    "internal error".to_string()
                } else {
                    err.to_string()
                };
                (status, code, message)
            }
        };

        let body = Json(json!({
            "error": code,
            "message": message,
        }));

        (status, body).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/holds", post(create_hold))
        .route("/v1/availability", get(availability))
        .route("/v1/reservations", get(list_reservations))
        .route("/v1/reservations/{slot_key}", get(get_reservation))
        .route("/v1/webhooks/payments", post(payment_webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "reservations": state.engine().stored_count(),
    }))
}

/// POST /v1/holds
/// Hold the slot and open the payment intent in one step.
async fn create_hold(
    State(state): State<AppState>,
    payload: Result<Json<HoldRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CheckoutReceipt>), ApiError> {
    let Json(req) = payload?;
    let receipt = state.checkout.start(req).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

/// GET /v1/availability?complex_id=..&field=..&date=YYYY-MM-DD&time=HH:MM
async fn availability(
    State(state): State<AppState>,
    query: Result<Query<SlotQuery>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(query) = query?;
    let (slot_key, free) = state.checkout.holds().check_availability(&query).await?;
    Ok(Json(json!({ "slot_key": slot_key, "free": free })))
}

/// GET /v1/reservations/{slot_key}
async fn get_reservation(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let slot = SlotKey::parse(&raw).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let body = match state.engine().get_reservation(&slot, now_ms()).await {
        Some(reservation) => json!(reservation),
        None => json!({ "slot_key": slot, "status": "none" }),
    };
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    complex_id: Option<String>,
}

/// GET /v1/reservations?complex_id=..
async fn list_reservations(State(state): State<AppState>, Query(query): Query<ListQuery>) -> Json<Value> {
    let live = state
        .engine()
        .list_live(now_ms(), query.complex_id.as_deref())
        .await;
    Json(json!(live))
}

/// POST /v1/webhooks/payments
/// Always 200 right away so the processor does not redeliver on our
/// account; the notification is applied on its own task.
async fn payment_webhook(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> StatusCode {
    let notification = notification_from(&body, &params);
    debug!("payment notification: {notification}");
    let reconciler = state.reconciler.clone();
    tokio::spawn(async move {
        reconciler.apply_notification(&notification).await;
    });
    StatusCode::OK
}

/// The processor sends either a JSON body or `?type=payment&data.id=..`
/// query parameters. The body wins when it carries anything.
fn notification_from(body: &[u8], params: &HashMap<String, String>) -> Value {
    if let Ok(value @ Value::Object(_)) = serde_json::from_slice::<Value>(body)
        && value.as_object().is_some_and(|o| !o.is_empty())
    {
        return value;
    }
    let mut value = json!({});
    if let Some(topic) = params.get("type").or_else(|| params.get("topic")) {
        value["type"] = json!(topic);
    }
    if let Some(id) = params.get("data.id").or_else(|| params.get("id")) {
        value["data"] = json!({ "id": id });
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn notification_prefers_json_body() {
        let body = br#"{"type":"payment","data":{"id":"9"}}"#;
        let value = notification_from(body, &params(&[("data.id", "1")]));
        assert_eq!(value["data"]["id"], "9");
    }

    #[test]
    fn notification_from_query_params() {
        let value = notification_from(b"", &params(&[("topic", "payment"), ("id", "5")]));
        assert_eq!(value, json!({"type": "payment", "data": {"id": "5"}}));

        let value = notification_from(b"{}", &params(&[("type", "payment"), ("data.id", "6")]));
        assert_eq!(value["data"]["id"], "6");
    }

    #[test]
    fn garbage_body_yields_empty_notification() {
        assert_eq!(notification_from(b"not json", &params(&[])), json!({}));
    }

    #[test]
    fn hold_errors_map_to_statuses() {
        let cases = [
            (
                HoldError::SlotTaken {
                    status: crate::model::ReservationStatus::Hold,
                },
                StatusCode::CONFLICT,
            ),
            (HoldError::StaleHold, StatusCode::CONFLICT),
            (HoldError::OutOfHours, StatusCode::UNPROCESSABLE_ENTITY),
            (HoldError::InThePast, StatusCode::UNPROCESSABLE_ENTITY),
            (HoldError::UnknownField("x".into()), StatusCode::NOT_FOUND),
            (HoldError::ProcessorUnavailable("down".into()), StatusCode::SERVICE_UNAVAILABLE),
            (
                HoldError::Store(crate::engine::EngineError::WalError("disk".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), status);
        }
    }
}
