use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::polling::VerificationScheduler;
use crate::error::{AppError, AppResult, PaymentError};
use crate::gateway::{to_minor_units, InitializeRequest, PaymentGateway};
use crate::ledger::models::{NewPayment, NewPaymentLog, PaymentLogEvent, PaymentType, UnitStatus};
use crate::ledger::{InsertOutcome, LedgerStore};

/// Fresh references tried before giving up on an initiation
pub const MAX_REFERENCE_ATTEMPTS: u32 = 3;

/// Smallest currency resolution accepted, in decimal places
const MINOR_UNIT_SCALE: u32 = 2;

#[derive(Debug, Clone)]
pub struct InitiatePayment {
    pub offer_token: String,
    pub amount: Decimal,
    pub email: String,
    pub callback_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InitiatedPayment {
    pub payment_id: Uuid,
    pub external_reference: String,
    pub access_url: String,
    pub access_code: String,
}

pub struct PaymentInitiator {
    ledger: Arc<dyn LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    scheduler: VerificationScheduler,
}

/// `OFR-<unix millis>-<8 hex digits>`
pub fn generate_reference() -> String {
    format!(
        "OFR-{}-{:08X}",
        Utc::now().timestamp_millis(),
        rand::random::<u32>()
    )
}

impl PaymentInitiator {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        scheduler: VerificationScheduler,
    ) -> Self {
        Self {
            ledger,
            gateway,
            scheduler,
        }
    }

    #[instrument(skip(self, request), fields(offer = %request.offer_token, amount = %request.amount))]
    pub async fn initiate(&self, request: InitiatePayment) -> AppResult<InitiatedPayment> {
        self.initiate_with(request, generate_reference).await
    }

    pub(crate) async fn initiate_with<F>(
        &self,
        request: InitiatePayment,
        mut next_reference: F,
    ) -> AppResult<InitiatedPayment>
    where
        F: FnMut() -> String + Send,
    {
        let offer = self
            .ledger
            .get_offer_by_token(&request.offer_token)
            .await?
            .ok_or_else(|| PaymentError::OfferNotFound(request.offer_token.clone()))?;

        if offer.status.is_terminal() {
            return Err(AppError::InvalidState {
                current: offer.status.to_string(),
                expected: "Pending or Accepted".into(),
            });
        }

        let amount_invalid = || PaymentError::AmountInvalid {
            amount: request.amount,
            outstanding: offer.outstanding_balance,
        };

        if request.amount <= Decimal::ZERO
            || request.amount > offer.outstanding_balance
            || request.amount.normalize().scale() > MINOR_UNIT_SCALE
        {
            return Err(amount_invalid().into());
        }
        let amount_minor = to_minor_units(request.amount).ok_or_else(amount_invalid)?;

        let unit = self
            .ledger
            .get_unit(offer.unit_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("unit {}", offer.unit_id)))?;
        if unit.status == UnitStatus::Occupied {
            return Err(PaymentError::UnitUnavailable(unit.id).into());
        }

        let payment_type = PaymentType::classify(request.amount, offer.outstanding_balance);

        for attempt in 1..=MAX_REFERENCE_ATTEMPTS {
            let reference = next_reference();

            if self.ledger.reference_exists(&reference).await? {
                warn!(
                    "⚠️ Reference {} already taken (attempt {}/{})",
                    reference, attempt, MAX_REFERENCE_ATTEMPTS
                );
                continue;
            }

            // Nothing is persisted unless the provider accepts the transaction
            let checkout = self
                .gateway
                .initialize(InitializeRequest {
                    email: request.email.clone(),
                    amount_minor,
                    reference: reference.clone(),
                    callback_url: request.callback_url.clone(),
                })
                .await?;

            let new_payment = NewPayment {
                offer_id: offer.id,
                amount: request.amount,
                payment_type,
                external_reference: reference.clone(),
                metadata: json!({
                    "email": request.email,
                    "access_code": checkout.access_code,
                }),
            };

            let payment = match self.ledger.insert_payment(new_payment).await? {
                InsertOutcome::Inserted(payment) => payment,
                InsertOutcome::Conflict => {
                    warn!(
                        "⚠️ Reference {} collided on insert (attempt {}/{})",
                        reference, attempt, MAX_REFERENCE_ATTEMPTS
                    );
                    continue;
                }
            };

            if let Err(e) = self
                .ledger
                .append_log(NewPaymentLog::new(
                    payment.id,
                    PaymentLogEvent::Initiated,
                    json!({
                        "amount": payment.amount,
                        "payment_type": payment.payment_type,
                        "outstanding_balance": offer.outstanding_balance,
                    }),
                ))
                .await
            {
                warn!("⚠️ Audit entry for {} not written: {}", reference, e);
            }

            if !self.scheduler.schedule(&reference) {
                warn!("⚠️ Verification for {} not scheduled, sweeper will close it", reference);
            }

            info!(
                "💳 Payment {} initiated: {} ({:?}) toward offer {}",
                reference, payment.amount, payment.payment_type, offer.id
            );

            return Ok(InitiatedPayment {
                payment_id: payment.id,
                external_reference: payment.external_reference,
                access_url: checkout.access_url,
                access_code: checkout.access_code,
            });
        }

        Err(PaymentError::ReferenceExhausted(MAX_REFERENCE_ATTEMPTS).into())
    }
}
