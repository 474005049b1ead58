use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::{AppError, AppResult, PaymentError};
use crate::ledger::models::{Offer, OfferStatus, Unit, UnitStatus};
use crate::ledger::{LedgerStore, LedgerTx, LockOutcome};

/// Applicant decisions on an offer. Each runs in one transaction with the unit row locked.
pub struct OfferService {
    ledger: Arc<dyn LedgerStore>,
    lock_wait: Duration,
}

impl OfferService {
    pub fn new(ledger: Arc<dyn LedgerStore>, lock_wait: Duration) -> Self {
        Self { ledger, lock_wait }
    }

    pub async fn get_offer(&self, token: &str) -> AppResult<Offer> {
        self.ledger
            .get_offer_by_token(token)
            .await?
            .ok_or_else(|| PaymentError::OfferNotFound(token.to_string()).into())
    }

    /// PENDING → ACCEPTED, moving a VACANT unit to OFFER_ACCEPTED
    pub async fn accept_offer(&self, token: &str) -> AppResult<Offer> {
        let mut tx = self.ledger.begin().await?;
        let result = self.accept_in(tx.as_mut(), token).await;
        finish(tx, result).await
    }

    /// PENDING/ACCEPTED → REJECTED while nothing has been paid.
    /// The unit goes back to VACANT once no accepted offer remains on it.
    pub async fn reject_offer(&self, token: &str) -> AppResult<Offer> {
        let mut tx = self.ledger.begin().await?;
        let result = self.reject_in(tx.as_mut(), token).await;
        finish(tx, result).await
    }

    async fn locked_offer(&self, tx: &mut dyn LedgerTx, token: &str) -> AppResult<(Offer, Unit)> {
        let offer = tx
            .get_offer_by_token(token)
            .await?
            .ok_or_else(|| PaymentError::OfferNotFound(token.to_string()))?;

        let unit = match tx.lock_unit(offer.unit_id, self.lock_wait).await? {
            LockOutcome::Acquired(unit) => unit,
            LockOutcome::Missing => {
                return Err(AppError::NotFound(format!("unit {}", offer.unit_id)))
            }
            LockOutcome::Contended => {
                return Err(AppError::Busy(format!(
                    "unit {} is being settled, retry shortly",
                    offer.unit_id
                )))
            }
        };

        let offer = tx
            .get_offer(offer.id)
            .await?
            .ok_or_else(|| PaymentError::OfferNotFound(token.to_string()))?;
        Ok((offer, unit))
    }

    async fn accept_in(&self, tx: &mut dyn LedgerTx, token: &str) -> AppResult<Offer> {
        let (mut offer, unit) = self.locked_offer(tx, token).await?;

        match offer.status {
            OfferStatus::Accepted => return Ok(offer),
            OfferStatus::Pending => {}
            other => {
                return Err(AppError::InvalidState {
                    current: other.to_string(),
                    expected: "Pending".into(),
                })
            }
        }

        if unit.status == UnitStatus::Occupied {
            return Err(PaymentError::UnitUnavailable(unit.id).into());
        }

        tx.set_offer_status(offer.id, OfferStatus::Accepted, None).await?;
        if unit.status == UnitStatus::Vacant {
            tx.set_unit_status(&unit, UnitStatus::OfferAccepted).await?;
        }

        offer.status = OfferStatus::Accepted;
        info!("✓ Offer {} accepted for unit {}", offer.id, unit.id);
        Ok(offer)
    }

    async fn reject_in(&self, tx: &mut dyn LedgerTx, token: &str) -> AppResult<Offer> {
        let (mut offer, unit) = self.locked_offer(tx, token).await?;

        match offer.status {
            OfferStatus::Rejected => return Ok(offer),
            OfferStatus::Pending | OfferStatus::Accepted => {}
            other => {
                return Err(AppError::InvalidState {
                    current: other.to_string(),
                    expected: "Pending or Accepted".into(),
                })
            }
        }

        if offer.amount_paid > Decimal::ZERO {
            return Err(AppError::InvalidState {
                current: format!("offer has {} in completed payments", offer.amount_paid),
                expected: "an offer with no completed payments".into(),
            });
        }

        tx.set_offer_status(offer.id, OfferStatus::Rejected, None).await?;

        if unit.status == UnitStatus::OfferAccepted {
            let still_accepted = tx
                .list_unit_offers(unit.id)
                .await?
                .iter()
                .any(|o| o.id != offer.id && o.status == OfferStatus::Accepted);
            if !still_accepted {
                tx.set_unit_status(&unit, UnitStatus::Vacant).await?;
                info!("Unit {} returned to vacant", unit.id);
            }
        }

        offer.status = OfferStatus::Rejected;
        info!("Offer {} rejected", offer.id);
        Ok(offer)
    }
}

/// Commit on success, roll back otherwise
pub(crate) async fn finish<T>(tx: Box<dyn LedgerTx>, result: AppResult<T>) -> AppResult<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_error) = tx.rollback().await {
                tracing::error!("Rollback failed: {}", rollback_error);
            }
            Err(e)
        }
    }
}
