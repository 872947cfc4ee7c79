//! Payment endpoints
//!
//! The storefront initiates a payment and then polls the status endpoint; each
//! poll is a gateway status check. Provider callbacks only nudge the same check.

use crate::api::AppState;
use crate::error::{AppError, AppErrorKind, DomainError};
use crate::payments::types::{AttemptState, PaymentAttempt, Provider};
use axum::body::Bytes;
use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// Header Airtel puts the callback HMAC in
const AIRTEL_SIGNATURE_HEADER: &str = "x-signature";

#[derive(Debug, Deserialize)]
pub struct InitiatePaymentRequest {
    pub order_id: String,
    pub provider: Provider,
    pub phone_number: String,
    pub amount: Decimal,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InitiatePaymentResponse {
    pub attempt_id: Uuid,
    pub state: AttemptState,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PaymentStatusResponse {
    pub attempt_id: Uuid,
    pub order_id: String,
    pub provider: Provider,
    pub amount: Decimal,
    pub state: AttemptState,
    pub provider_reference: Option<String>,
    pub provider_receipt: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl From<PaymentAttempt> for PaymentStatusResponse {
    fn from(attempt: PaymentAttempt) -> Self {
        Self {
            attempt_id: attempt.attempt_id,
            order_id: attempt.order_id,
            provider: attempt.provider,
            amount: attempt.amount,
            state: attempt.state,
            provider_reference: attempt.provider_reference,
            provider_receipt: attempt.provider_receipt,
            failure_reason: attempt.failure_reason,
            created_at: attempt.created_at,
            expires_at: attempt.expires_at,
            resolved_at: attempt.resolved_at,
        }
    }
}

/// `POST /api/payments`
pub async fn initiate_payment(
    State(state): State<AppState>,
    payload: Result<Json<InitiatePaymentRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<InitiatePaymentResponse>), AppError> {
    let Json(request) = payload.map_err(|e| AppError::validation(e.body_text()))?;

    if request.order_id.trim().is_empty() {
        return Err(AppError::validation("order_id is required"));
    }
    if request.phone_number.trim().is_empty() {
        return Err(AppError::validation("phone_number is required"));
    }

    let attempt_id = state
        .coordinator
        .initiate(
            request.order_id.trim(),
            request.provider,
            request.phone_number.trim(),
            request.amount,
        )
        .await?;
    let attempt = state.coordinator.get_attempt(attempt_id).await?;

    Ok((
        StatusCode::CREATED,
        Json(InitiatePaymentResponse {
            attempt_id,
            state: attempt.state,
        }),
    ))
}

/// `GET /api/payments/:attempt_id`
pub async fn get_payment_status(
    State(state): State<AppState>,
    attempt_id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<PaymentStatusResponse>, AppError> {
    let Path(attempt_id) = attempt_id.map_err(|e| AppError::validation(e.body_text()))?;

    state.coordinator.poll_status(attempt_id).await?;
    let attempt = state.coordinator.get_attempt(attempt_id).await?;

    Ok(Json(attempt.into()))
}

/// Daraja expects this exact acknowledgement shape
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MpesaAck {
    pub result_code: u8,
    pub result_desc: &'static str,
}

#[derive(Debug, Serialize)]
pub struct CallbackAck {
    pub status: &'static str,
}

/// `POST /api/payments/callbacks/mpesa`
pub async fn mpesa_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<MpesaAck>, AppError> {
    process_callback(&state, Provider::Mpesa, &headers, &body, None).await?;
    Ok(Json(MpesaAck {
        result_code: 0,
        result_desc: "Accepted",
    }))
}

/// `POST /api/payments/callbacks/airtel`
pub async fn airtel_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CallbackAck>, AppError> {
    process_callback(
        &state,
        Provider::AirtelMoney,
        &headers,
        &body,
        Some(AIRTEL_SIGNATURE_HEADER),
    )
    .await?;
    Ok(Json(CallbackAck { status: "received" }))
}

/// Verify, log and apply a provider callback
///
/// Once the body is authenticated and parsed the callback is acknowledged even
/// if the status check fails; the next poll or sweep picks the attempt up.
async fn process_callback(
    state: &AppState,
    provider: Provider,
    headers: &HeaderMap,
    body: &[u8],
    signature_header: Option<&str>,
) -> Result<(), AppError> {
    let gateway = state.coordinator.gateway(provider)?;

    let signature = signature_header
        .and_then(|name| headers.get(name))
        .and_then(|value| value.to_str().ok());
    if !gateway.validate_callback_signature(body, signature) {
        warn!(provider = %provider, "Rejected callback with invalid signature");
        return Err(AppError::new(AppErrorKind::Domain(
            DomainError::InvalidSignature,
        )));
    }

    let notice = gateway.parse_callback(body).map_err(|e| {
        warn!(provider = %provider, error = %e, "Unparseable callback");
        AppError::validation(e.to_string())
    })?;

    info!(
        provider = %provider,
        provider_reference = %notice.provider_reference,
        reported = ?notice.reported,
        "Payment callback received"
    );

    let logged = match &state.callbacks {
        Some(callbacks) => {
            let payload = serde_json::from_slice(body).unwrap_or_else(|_| {
                serde_json::Value::String(String::from_utf8_lossy(body).into_owned())
            });
            match callbacks
                .log_event(provider, Some(&notice.provider_reference), payload)
                .await
            {
                Ok(event) => Some((callbacks, event.id)),
                Err(e) => {
                    warn!(provider = %provider, error = %e, "Failed to log payment callback");
                    None
                }
            }
        }
        None => None,
    };

    let outcome = state
        .coordinator
        .handle_callback(provider, &notice.provider_reference)
        .await;

    match (&outcome, logged) {
        (Ok(_), Some((callbacks, id))) => {
            if let Err(e) = callbacks.mark_processed(id).await {
                warn!(callback_id = %id, error = %e, "Failed to mark callback processed");
            }
        }
        (Err(err), Some((callbacks, id))) => {
            if let Err(e) = callbacks.record_failure(id, &err.to_string()).await {
                warn!(callback_id = %id, error = %e, "Failed to record callback failure");
            }
        }
        _ => {}
    }

    match outcome {
        Ok(Some(resolved)) => {
            info!(
                provider = %provider,
                provider_reference = %notice.provider_reference,
                state = %resolved,
                "Callback applied"
            );
        }
        Ok(None) => {}
        Err(e) => {
            warn!(
                provider = %provider,
                provider_reference = %notice.provider_reference,
                error = %e,
                "Callback status check failed"
            );
        }
    }

    Ok(())
}
