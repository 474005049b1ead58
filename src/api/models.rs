use crate::ledger::models::*;
use crate::ledger::RefundOwed;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

// ========== REQUEST MODELS ==========

/// Request to start a payment toward an offer
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct InitiatePaymentRequest {
    /// Major currency units, at most two decimal places
    pub amount: Decimal,

    #[validate(email(message = "must be a valid email address"))]
    pub email: String,

    /// Where the provider sends the payer after checkout
    #[validate(url(message = "must be a valid URL"))]
    pub callback_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RefundRequest {
    /// Free-form operator note, e.g. the transfer reference
    pub note: Option<String>,
}

// ========== RESPONSE MODELS ==========

#[derive(Debug, Serialize)]
pub struct OfferResponse {
    pub id: Uuid,
    pub token: String,
    pub unit_id: Uuid,
    pub total_amount: Decimal,
    pub amount_paid: Decimal,
    pub outstanding_balance: Decimal,
    pub payment_status: OfferPaymentStatus,
    pub status: OfferStatus,
    pub selected_at: Option<DateTime<Utc>>,
}

impl From<Offer> for OfferResponse {
    fn from(offer: Offer) -> Self {
        Self {
            id: offer.id,
            token: offer.token,
            unit_id: offer.unit_id,
            total_amount: offer.total_amount,
            amount_paid: offer.amount_paid,
            outstanding_balance: offer.outstanding_balance,
            payment_status: offer.payment_status,
            status: offer.status,
            selected_at: offer.selected_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PaymentResponse {
    pub id: Uuid,
    pub offer_id: Uuid,
    pub amount: Decimal,
    pub payment_type: PaymentType,
    pub status: PaymentStatus,
    pub external_reference: String,
    pub method: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<Payment> for PaymentResponse {
    fn from(payment: Payment) -> Self {
        Self {
            id: payment.id,
            offer_id: payment.offer_id,
            amount: payment.amount,
            payment_type: payment.payment_type,
            status: payment.status,
            external_reference: payment.external_reference,
            method: payment.method,
            paid_at: payment.paid_at,
            created_at: payment.created_at,
        }
    }
}

/// Result of an on-demand verification
#[derive(Debug, Serialize)]
pub struct VerifyPaymentResponse {
    pub payment: PaymentResponse,
    /// e.g. `Settled(Allocated { .. })`, `StillPending`
    pub outcome: String,
}

#[derive(Debug, Serialize)]
pub struct RefundOwedResponse {
    pub payment: PaymentResponse,
    pub offer: OfferResponse,
}

impl From<RefundOwed> for RefundOwedResponse {
    fn from(owed: RefundOwed) -> Self {
        Self {
            payment: owed.payment.into(),
            offer: owed.offer.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub database: bool,
    pub timestamp: DateTime<Utc>,
}

/// Webhook acknowledgement, returned for every authenticated event
#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookAck {
    pub received: bool,
}

impl WebhookAck {
    pub fn received() -> Self {
        Self { received: true }
    }
}
