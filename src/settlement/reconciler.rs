// Reconciler: turns a verified gateway result into ledger changes and an
// allocation decision. Every verification channel ends up here.
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::allocation::allocate;
use crate::config::SettlementConfig;
use crate::dispatch::{Collaborators, HistoryEventKind, SideEffect, SideEffectDispatcher, TenantRegistry};
use crate::error::{AppError, AppResult, PaymentError};
use crate::gateway::{GatewayResult, GatewayStatus};
use crate::ledger::models::*;
use crate::ledger::{LedgerStore, LedgerTx, LockOutcome};

/// Which entry point delivered the gateway result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationSource {
    Webhook,
    Polling,
    Sweeper,
    Callback,
}

impl fmt::Display for VerificationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VerificationSource::Webhook => "webhook",
            VerificationSource::Polling => "polling",
            VerificationSource::Sweeper => "sweeper",
            VerificationSource::Callback => "callback",
        };
        f.write_str(name)
    }
}

/// What happened to a completed payment's offer
#[derive(Debug, Clone, PartialEq)]
pub enum SettlementDecision {
    /// Money accumulated, offer still owes `outstanding`
    Partial { outstanding: Decimal },
    /// This offer won the unit
    Allocated { losers: Vec<Uuid> },
    /// Fully paid, but the unit was taken while the payment was in flight
    RaceHeld,
    /// Offer lost (or had already lost) the unit; its money is owed back
    RejectedByPayment,
    /// Offer was already SELECTED; `surplus` is owed back
    Overpaid { surplus: Decimal },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// Provider has no final answer yet
    StillPending,
    /// Another reconciliation holds the payment or unit row
    Contended,
    AlreadyCompleted,
    /// Payment was FAILED or REFUNDED before this result arrived
    AlreadyTerminal(PaymentStatus),
    Failed,
    Settled(SettlementDecision),
}

impl ReconcileOutcome {
    /// Polling should check this reference again later
    pub fn needs_retry(&self) -> bool {
        matches!(self, ReconcileOutcome::StillPending | ReconcileOutcome::Contended)
    }
}

pub struct Reconciler {
    ledger: Arc<dyn LedgerStore>,
    tenants: Arc<dyn TenantRegistry>,
    collaborators: Arc<dyn Collaborators>,
    dispatcher: SideEffectDispatcher,
    config: SettlementConfig,
}

impl Reconciler {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        tenants: Arc<dyn TenantRegistry>,
        collaborators: Arc<dyn Collaborators>,
        dispatcher: SideEffectDispatcher,
        config: SettlementConfig,
    ) -> Self {
        Self {
            ledger,
            tenants,
            collaborators,
            dispatcher,
            config,
        }
    }

    /// Apply `result` in one transaction, then queue side effects.
    ///
    /// Safe to call concurrently for the same reference: the payment row lock
    /// plus the COMPLETED check make the second caller a no-op.
    #[instrument(skip(self, result), fields(reference = %result.reference, status = ?result.status))]
    pub async fn reconcile(
        &self,
        result: &GatewayResult,
        source: VerificationSource,
    ) -> AppResult<ReconcileOutcome> {
        if result.status == GatewayStatus::Pending {
            debug!("Payment {} still pending at provider ({})", result.reference, source);
            return Ok(ReconcileOutcome::StillPending);
        }

        let mut tx = self.ledger.begin().await?;
        let (outcome, effects) = match self.settle(tx.as_mut(), result, source).await {
            Ok(settled) => settled,
            Err(e) => {
                if let Err(rollback_error) = tx.rollback().await {
                    error!("Rollback failed for {}: {}", result.reference, rollback_error);
                }
                return Err(e);
            }
        };
        // A lock timeout aborts the Postgres transaction, so there is nothing to keep
        if outcome == ReconcileOutcome::Contended {
            tx.rollback().await?;
            info!(
                "🔄 Payment {} is being reconciled elsewhere, leaving it to that worker",
                result.reference
            );
            return Ok(outcome);
        }
        tx.commit().await?;

        match &outcome {
            ReconcileOutcome::Settled(decision) => {
                info!(
                    "✓ Payment {} settled via {}: {:?}",
                    result.reference, source, decision
                );
            }
            other => debug!("Payment {} via {}: {:?}", result.reference, source, other),
        }

        self.dispatcher.dispatch_all(effects);
        Ok(outcome)
    }

    async fn settle(
        &self,
        tx: &mut dyn LedgerTx,
        result: &GatewayResult,
        source: VerificationSource,
    ) -> AppResult<(ReconcileOutcome, Vec<SideEffect>)> {
        let wait = self.config.lock_wait();

        let payment = match tx.lock_payment_by_reference(&result.reference, wait).await? {
            LockOutcome::Acquired(payment) => payment,
            LockOutcome::Missing => {
                error!("❌ Verification for unknown payment reference {}", result.reference);
                return Err(PaymentError::PaymentNotFound(result.reference.clone()).into());
            }
            LockOutcome::Contended => return Ok((ReconcileOutcome::Contended, Vec::new())),
        };

        match payment.status {
            PaymentStatus::Pending => {}
            PaymentStatus::Completed => {
                return Ok((ReconcileOutcome::AlreadyCompleted, Vec::new()));
            }
            // Already completed once and handed back; a redelivery changes nothing
            PaymentStatus::Refunded => {
                return Ok((
                    ReconcileOutcome::AlreadyTerminal(PaymentStatus::Refunded),
                    Vec::new(),
                ));
            }
            status @ PaymentStatus::Failed => {
                if result.status == GatewayStatus::Success {
                    warn!(
                        "⚠️ Late success for {} payment {}, manual refund required",
                        status.as_str(),
                        payment.external_reference
                    );
                    tx.append_log(NewPaymentLog::new(
                        payment.id,
                        PaymentLogEvent::LateSuccessIgnored,
                        json!({ "source": source.to_string(), "gateway": result.raw }),
                    ))
                    .await?;
                }
                return Ok((ReconcileOutcome::AlreadyTerminal(status), Vec::new()));
            }
        }

        if result.status == GatewayStatus::Failed {
            tx.fail_payment(payment.id, Some(result.raw.clone())).await?;
            tx.append_log(NewPaymentLog::new(
                payment.id,
                PaymentLogEvent::Failed,
                json!({ "source": source.to_string(), "gateway": result.raw }),
            ))
            .await?;
            info!("Payment {} failed at provider", payment.external_reference);
            return Ok((ReconcileOutcome::Failed, Vec::new()));
        }

        let offer_id = payment.offer_id;
        let unit_id = tx
            .get_offer(offer_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("offer {}", offer_id)))?
            .unit_id;

        let unit = match tx.lock_unit(unit_id, wait).await? {
            LockOutcome::Acquired(unit) => unit,
            LockOutcome::Missing => return Err(AppError::NotFound(format!("unit {}", unit_id))),
            LockOutcome::Contended => return Ok((ReconcileOutcome::Contended, Vec::new())),
        };

        // Offer state is only trustworthy once the unit lock is held
        let offer = tx
            .get_offer(offer_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("offer {}", offer_id)))?;

        if let Some(reported) = result.amount {
            if reported != payment.amount {
                warn!(
                    "⚠️ Gateway amount {} differs from ledger amount {} for {}; using ledger",
                    reported, payment.amount, payment.external_reference
                );
            }
        }

        tx.complete_payment(
            payment.id,
            result.channel.clone(),
            result.paid_at.unwrap_or_else(Utc::now),
            result.raw.clone(),
        )
        .await?;

        let update = offer.apply_payment(payment.amount, self.config.fully_paid_epsilon);
        tx.apply_offer_ledger(offer.id, &update).await?;
        tx.append_log(NewPaymentLog::new(
            payment.id,
            PaymentLogEvent::Completed,
            json!({
                "source": source.to_string(),
                "amount": payment.amount,
                "amount_paid": update.amount_paid,
                "outstanding_balance": update.outstanding_balance,
            }),
        ))
        .await?;

        let mut offer = offer;
        let previous_status = offer.status;
        offer.amount_paid = update.amount_paid;
        offer.outstanding_balance = update.outstanding_balance;
        offer.payment_status = update.payment_status;

        let mut effects = vec![SideEffect::RecordInvoicePayment {
            offer_id: offer.id,
            amount: payment.amount,
            reference: payment.external_reference.clone(),
        }];

        let decision = match previous_status {
            OfferStatus::Selected => {
                let surplus = (update.amount_paid - offer.total_amount)
                    .max(Decimal::ZERO)
                    .min(payment.amount);
                warn!(
                    "⚠️ Offer {} already selected, payment {} overpaid by {}",
                    offer.id, payment.external_reference, surplus
                );
                tx.append_log(NewPaymentLog::new(
                    payment.id,
                    PaymentLogEvent::Overpaid,
                    json!({ "surplus": surplus }),
                ))
                .await?;
                effects.push(SideEffect::NotifyRefundOwed {
                    offer: offer.clone(),
                    amount: surplus,
                });
                SettlementDecision::Overpaid { surplus }
            }
            OfferStatus::PaymentHeldRaceCondition => {
                self.hold_for_race(tx, &payment, &mut offer, &mut effects).await?
            }
            OfferStatus::RejectedByPayment | OfferStatus::Rejected => {
                self.reject_by_payment(tx, &payment, &mut offer, &mut effects)
                    .await?
            }
            OfferStatus::Pending | OfferStatus::Accepted => {
                if update.is_fully_paid() && unit.status != UnitStatus::Occupied {
                    let allocation = allocate(
                        tx,
                        &unit,
                        &offer,
                        self.tenants.as_ref(),
                        self.collaborators.as_ref(),
                    )
                    .await?;

                    let losers: Vec<Uuid> = allocation.losers.iter().map(|o| o.id).collect();
                    effects.push(SideEffect::NotifyWinner(allocation.winner.clone()));
                    if !allocation.losers.is_empty() {
                        effects.push(SideEffect::NotifyLosers(allocation.losers));
                    }
                    effects.push(SideEffect::NotifyLandlord {
                        offer: allocation.winner,
                        outstanding: Decimal::ZERO,
                    });
                    SettlementDecision::Allocated { losers }
                } else if update.is_fully_paid() {
                    self.hold_for_race(tx, &payment, &mut offer, &mut effects).await?
                } else if unit.status == UnitStatus::Occupied {
                    self.reject_by_payment(tx, &payment, &mut offer, &mut effects)
                        .await?
                } else {
                    effects.push(SideEffect::NotifyLandlord {
                        offer: offer.clone(),
                        outstanding: update.outstanding_balance,
                    });
                    SettlementDecision::Partial {
                        outstanding: update.outstanding_balance,
                    }
                }
            }
        };

        Ok((ReconcileOutcome::Settled(decision), effects))
    }

    /// Fully paid after the unit was taken by someone else
    async fn hold_for_race(
        &self,
        tx: &mut dyn LedgerTx,
        payment: &Payment,
        offer: &mut Offer,
        effects: &mut Vec<SideEffect>,
    ) -> AppResult<SettlementDecision> {
        warn!(
            "⚠️ Race detected: offer {} fully paid but unit {} is occupied, holding {} for refund",
            offer.id, offer.unit_id, offer.amount_paid
        );
        if offer.status != OfferStatus::PaymentHeldRaceCondition {
            tx.set_offer_status(offer.id, OfferStatus::PaymentHeldRaceCondition, None)
                .await?;
            offer.status = OfferStatus::PaymentHeldRaceCondition;
        }
        tx.append_log(NewPaymentLog::new(
            payment.id,
            PaymentLogEvent::RaceConditionHeld,
            json!({ "unit_id": offer.unit_id, "amount_paid": offer.amount_paid }),
        ))
        .await?;

        effects.push(SideEffect::RecordHistory {
            unit_id: offer.unit_id,
            kind: HistoryEventKind::PaymentHeldRaceCondition,
            description: format!(
                "Offer {} completed payment after the unit was secured; {} held for refund",
                offer.id, offer.amount_paid
            ),
        });
        effects.push(SideEffect::NotifyRefundOwed {
            offer: offer.clone(),
            amount: payment.amount,
        });
        Ok(SettlementDecision::RaceHeld)
    }

    /// Money landed on an offer that cannot win any more
    async fn reject_by_payment(
        &self,
        tx: &mut dyn LedgerTx,
        payment: &Payment,
        offer: &mut Offer,
        effects: &mut Vec<SideEffect>,
    ) -> AppResult<SettlementDecision> {
        if offer.status != OfferStatus::RejectedByPayment {
            tx.set_offer_status(offer.id, OfferStatus::RejectedByPayment, None)
                .await?;
            offer.status = OfferStatus::RejectedByPayment;
        }
        tx.append_log(NewPaymentLog::new(
            payment.id,
            PaymentLogEvent::RejectedByPayment,
            json!({ "unit_id": offer.unit_id, "amount": payment.amount }),
        ))
        .await?;
        info!(
            "Offer {} cannot win unit {}, payment {} owed back",
            offer.id, offer.unit_id, payment.external_reference
        );

        effects.push(SideEffect::NotifyRefundOwed {
            offer: offer.clone(),
            amount: payment.amount,
        });
        Ok(SettlementDecision::RejectedByPayment)
    }
}
