use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::models::*;
use super::webhook::{verify_signature, WebhookEvent, WebhookProcessor, SIGNATURE_HEADER};
use crate::{
    error::{AppError, AppResult, PaymentError},
    ledger::LedgerStore,
    settlement::{InitiatePayment, InitiatedPayment, OfferService, PaymentInitiator, PollingWorker, RefundDesk},
};

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<dyn LedgerStore>,
    pub initiator: Arc<PaymentInitiator>,
    pub offers: Arc<OfferService>,
    pub poller: Arc<PollingWorker>,
    pub refunds: Arc<RefundDesk>,
    pub webhooks: Arc<WebhookProcessor>,
    pub webhook_secret: Arc<str>,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let database = match state.ledger.ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!("⚠️ Database health check failed: {}", e);
            false
        }
    };

    Json(HealthResponse {
        status: if database { "healthy" } else { "degraded" }.to_string(),
        database,
        timestamp: Utc::now(),
    })
}

/// Start a payment toward an offer
/// POST /offers/:token/payments
pub async fn initiate_payment(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(request): Json<InitiatePaymentRequest>,
) -> AppResult<(StatusCode, Json<InitiatedPayment>)> {
    info!("💳 Initiating payment of {} for offer {}", request.amount, token);

    let initiated = state
        .initiator
        .initiate(InitiatePayment {
            offer_token: token,
            amount: request.amount,
            email: request.email,
            callback_url: request.callback_url,
        })
        .await?;

    info!(
        "✓ Payment {} initiated with reference {}",
        initiated.payment_id, initiated.external_reference
    );
    Ok((StatusCode::CREATED, Json(initiated)))
}

/// GET /offers/:token
pub async fn get_offer(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> AppResult<Json<OfferResponse>> {
    let offer = state.offers.get_offer(&token).await?;
    Ok(Json(offer.into()))
}

/// POST /offers/:token/accept
pub async fn accept_offer(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> AppResult<Json<OfferResponse>> {
    info!("Accepting offer {}", token);
    let offer = state.offers.accept_offer(&token).await?;
    Ok(Json(offer.into()))
}

/// POST /offers/:token/reject
pub async fn reject_offer(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> AppResult<Json<OfferResponse>> {
    info!("Rejecting offer {}", token);
    let offer = state.offers.reject_offer(&token).await?;
    Ok(Json(offer.into()))
}

/// Gateway push notifications.
/// POST /webhooks/gateway
///
/// - Rejects bodies whose signature does not match with 401
/// - Acknowledges every authenticated event immediately, even ones it ignores,
///   so the provider stops redelivering
/// - Reconciliation happens in the background
pub async fn gateway_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<WebhookAck>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or(AppError::InvalidSignature)?;

    if !verify_signature(&state.webhook_secret, &body, signature) {
        warn!("⚠️ Rejected webhook with invalid signature");
        return Err(AppError::InvalidSignature);
    }

    let raw: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(raw) => raw,
        Err(e) => {
            warn!("⚠️ Unparseable webhook body: {}", e);
            return Ok(Json(WebhookAck::received()));
        }
    };

    let event: WebhookEvent = match serde_json::from_value(raw.clone()) {
        Ok(event) => event,
        Err(e) => {
            warn!("⚠️ Webhook without a usable payload: {}", e);
            return Ok(Json(WebhookAck::received()));
        }
    };

    let event_name = event.event.clone();
    match event.into_gateway_result(raw) {
        Some(result) => {
            info!("📨 Webhook {} for {}", event_name, result.reference);
            state.webhooks.process_async(result);
        }
        None => info!("Ignoring webhook event {}", event_name),
    }

    Ok(Json(WebhookAck::received()))
}

/// GET /payments/:reference
pub async fn get_payment(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> AppResult<Json<PaymentResponse>> {
    let payment = state
        .ledger
        .get_payment_by_reference(&reference)
        .await?
        .ok_or(PaymentError::PaymentNotFound(reference))?;
    Ok(Json(payment.into()))
}

/// Verify on demand, used by the payer's callback page
/// POST /payments/:reference/verify
pub async fn verify_payment(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> AppResult<Json<VerifyPaymentResponse>> {
    info!("🔍 On-demand verification of {}", reference);
    let (payment, outcome) = state.poller.verify_now(&reference).await?;
    Ok(Json(VerifyPaymentResponse {
        payment: payment.into(),
        outcome: format!("{:?}", outcome),
    }))
}

/// GET /admin/refunds
pub async fn list_refunds(State(state): State<AppState>) -> AppResult<Json<Vec<RefundOwedResponse>>> {
    let owed = state.refunds.list_refunds_owed().await?;
    Ok(Json(owed.into_iter().map(Into::into).collect()))
}

/// Record that money was handed back out of band
/// POST /admin/payments/:id/refund
pub async fn mark_refunded(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
    request: Option<Json<RefundRequest>>,
) -> AppResult<Json<PaymentResponse>> {
    let note = request.and_then(|Json(request)| request.note);
    info!("💸 Marking payment {} refunded", payment_id);
    let payment = state.refunds.mark_refunded(payment_id, note).await?;
    Ok(Json(payment.into()))
}
