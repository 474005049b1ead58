// Refund desk: money owed back is only flagged by settlement; an operator
// hands it back out of band and records that here.
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use super::offers::finish;
use crate::error::{AppError, AppResult, PaymentError};
use crate::ledger::models::{NewPaymentLog, Payment, PaymentLogEvent, PaymentStatus};
use crate::ledger::{LedgerStore, LedgerTx, LockOutcome, RefundOwed};

pub struct RefundDesk {
    ledger: Arc<dyn LedgerStore>,
    lock_wait: Duration,
}

impl RefundDesk {
    pub fn new(ledger: Arc<dyn LedgerStore>, lock_wait: Duration) -> Self {
        Self { ledger, lock_wait }
    }

    pub async fn list_refunds_owed(&self) -> AppResult<Vec<RefundOwed>> {
        self.ledger.list_refunds_owed().await
    }

    /// COMPLETED → REFUNDED for a payment that is owed back. Offer ledger is unchanged.
    pub async fn mark_refunded(&self, payment_id: Uuid, note: Option<String>) -> AppResult<Payment> {
        let overpaid = self
            .ledger
            .list_payment_logs(payment_id)
            .await?
            .iter()
            .any(|log| log.event_type == PaymentLogEvent::Overpaid);

        let mut tx = self.ledger.begin().await?;
        let result = self
            .refund_in(tx.as_mut(), payment_id, overpaid, note)
            .await;
        finish(tx, result).await
    }

    async fn refund_in(
        &self,
        tx: &mut dyn LedgerTx,
        payment_id: Uuid,
        overpaid: bool,
        note: Option<String>,
    ) -> AppResult<Payment> {
        let mut payment = match tx.lock_payment(payment_id, self.lock_wait).await? {
            LockOutcome::Acquired(payment) => payment,
            LockOutcome::Missing => {
                return Err(PaymentError::PaymentNotFound(payment_id.to_string()).into())
            }
            LockOutcome::Contended => {
                return Err(AppError::Busy(format!("payment {} is being settled", payment_id)))
            }
        };

        if payment.status != PaymentStatus::Completed {
            return Err(PaymentError::NotRefundable(payment_id).into());
        }

        let offer = tx
            .get_offer(payment.offer_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("offer {}", payment.offer_id)))?;
        if !offer.status.owes_refund() && !overpaid {
            return Err(PaymentError::NotRefundable(payment_id).into());
        }

        tx.mark_payment_refunded(payment.id).await?;
        tx.append_log(NewPaymentLog::new(
            payment.id,
            PaymentLogEvent::Refunded,
            json!({ "amount": payment.amount, "offer_status": offer.status, "note": note }),
        ))
        .await?;

        payment.status = PaymentStatus::Refunded;
        info!(
            "💸 Payment {} marked refunded ({} on offer {})",
            payment.external_reference, payment.amount, offer.id
        );
        Ok(payment)
    }
}
