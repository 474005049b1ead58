// In-memory ledger used by the settlement tests.
//
// A transaction takes one store-wide lock the first time it touches state, so
// concurrent transactions serialize the same way row locks serialize them in
// Postgres. Writes go to a working copy that only replaces the shared state on commit.

use super::models::*;
use super::{InsertOutcome, LedgerStore, LedgerTx, LockOutcome, RefundOwed};
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

const DEFAULT_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Clone)]
pub struct LedgerState {
    pub units: HashMap<Uuid, Unit>,
    pub offers: HashMap<Uuid, Offer>,
    pub payments: HashMap<Uuid, Payment>,
    pub logs: Vec<PaymentLog>,
}

impl LedgerState {
    fn payment_by_reference(&self, reference: &str) -> Option<&Payment> {
        self.payments
            .values()
            .find(|p| p.external_reference == reference)
    }

    pub fn logs_for(&self, payment_id: Uuid) -> Vec<&PaymentLog> {
        self.logs.iter().filter(|l| l.payment_id == payment_id).collect()
    }

    fn push_log(&mut self, entry: NewPaymentLog) {
        self.logs.push(PaymentLog {
            id: Uuid::new_v4(),
            payment_id: entry.payment_id,
            event_type: entry.event_type,
            payload: entry.payload,
            created_at: Utc::now(),
        });
    }
}

#[derive(Clone, Default)]
pub struct MemoryLedger {
    state: Arc<Mutex<LedgerState>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> LedgerState {
        self.state.lock().await.clone()
    }

    pub async fn seed_unit(&self, status: UnitStatus) -> Unit {
        let unit = Unit {
            id: Uuid::new_v4(),
            status,
            updated_at: Utc::now(),
        };
        self.state.lock().await.units.insert(unit.id, unit.clone());
        unit
    }

    pub async fn seed_offer(&self, unit_id: Uuid, total: Decimal, status: OfferStatus) -> Offer {
        let offer = Offer {
            id: Uuid::new_v4(),
            unit_id,
            landlord_id: Uuid::new_v4(),
            applicant_id: Uuid::new_v4(),
            token: format!("offer-{}", Uuid::new_v4().simple()),
            total_amount: total,
            amount_paid: Decimal::ZERO,
            outstanding_balance: total,
            payment_status: OfferPaymentStatus::Unpaid,
            status,
            selected_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.state.lock().await.offers.insert(offer.id, offer.clone());
        offer
    }

    /// Insert a PENDING payment directly, bypassing the initiator
    pub async fn seed_payment(&self, offer: &Offer, amount: Decimal, reference: &str) -> Payment {
        let payment = Payment {
            id: Uuid::new_v4(),
            offer_id: offer.id,
            amount,
            payment_type: PaymentType::classify(amount, offer.outstanding_balance),
            status: PaymentStatus::Pending,
            external_reference: reference.to_string(),
            method: None,
            paid_at: None,
            metadata: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.state
            .lock()
            .await
            .payments
            .insert(payment.id, payment.clone());
        payment
    }

    pub async fn backdate_payment(&self, payment_id: Uuid, created_at: DateTime<Utc>) {
        if let Some(payment) = self.state.lock().await.payments.get_mut(&payment_id) {
            payment.created_at = created_at;
            payment.updated_at = created_at;
        }
    }

    pub async fn payment(&self, payment_id: Uuid) -> Payment {
        self.state.lock().await.payments[&payment_id].clone()
    }

    pub async fn offer(&self, offer_id: Uuid) -> Offer {
        self.state.lock().await.offers[&offer_id].clone()
    }

    pub async fn unit(&self, unit_id: Uuid) -> Unit {
        self.state.lock().await.units[&unit_id].clone()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn begin(&self) -> AppResult<Box<dyn LedgerTx>> {
        Ok(Box::new(MemoryTx {
            shared: self.state.clone(),
            guard: None,
            working: None,
        }))
    }

    async fn ping(&self) -> AppResult<()> {
        Ok(())
    }

    async fn get_offer_by_token(&self, token: &str) -> AppResult<Option<Offer>> {
        Ok(self
            .state
            .lock()
            .await
            .offers
            .values()
            .find(|o| o.token == token)
            .cloned())
    }

    async fn get_unit(&self, unit_id: Uuid) -> AppResult<Option<Unit>> {
        Ok(self.state.lock().await.units.get(&unit_id).cloned())
    }

    async fn get_payment_by_reference(&self, reference: &str) -> AppResult<Option<Payment>> {
        Ok(self
            .state
            .lock()
            .await
            .payment_by_reference(reference)
            .cloned())
    }

    async fn reference_exists(&self, reference: &str) -> AppResult<bool> {
        Ok(self
            .state
            .lock()
            .await
            .payment_by_reference(reference)
            .is_some())
    }

    async fn insert_payment(&self, payment: NewPayment) -> AppResult<InsertOutcome> {
        let mut state = self.state.lock().await;
        if state
            .payment_by_reference(&payment.external_reference)
            .is_some()
        {
            return Ok(InsertOutcome::Conflict);
        }

        let now = Utc::now();
        let row = Payment {
            id: Uuid::new_v4(),
            offer_id: payment.offer_id,
            amount: payment.amount,
            payment_type: payment.payment_type,
            status: PaymentStatus::Pending,
            external_reference: payment.external_reference,
            method: None,
            paid_at: None,
            metadata: Some(payment.metadata),
            created_at: now,
            updated_at: now,
        };
        state.payments.insert(row.id, row.clone());
        Ok(InsertOutcome::Inserted(row))
    }

    async fn list_stale_pending(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<Payment>> {
        let state = self.state.lock().await;
        let mut stale: Vec<Payment> = state
            .payments
            .values()
            .filter(|p| p.status == PaymentStatus::Pending && p.created_at < created_before)
            .cloned()
            .collect();
        stale.sort_by_key(|p| (p.updated_at, p.created_at));
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }

    async fn touch_payment(&self, payment_id: Uuid) -> AppResult<()> {
        if let Some(payment) = self.state.lock().await.payments.get_mut(&payment_id) {
            if payment.status == PaymentStatus::Pending {
                payment.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn list_refunds_owed(&self) -> AppResult<Vec<RefundOwed>> {
        let state = self.state.lock().await;
        let mut owed: Vec<RefundOwed> = state
            .payments
            .values()
            .filter(|p| p.status == PaymentStatus::Completed)
            .filter_map(|p| {
                let offer = state.offers.get(&p.offer_id)?;
                let overpaid = state
                    .logs_for(p.id)
                    .iter()
                    .any(|l| l.event_type == PaymentLogEvent::Overpaid);
                (offer.status.owes_refund() || overpaid).then(|| RefundOwed {
                    payment: p.clone(),
                    offer: offer.clone(),
                })
            })
            .collect();
        owed.sort_by_key(|r| r.payment.paid_at);
        Ok(owed)
    }

    async fn list_payment_logs(&self, payment_id: Uuid) -> AppResult<Vec<PaymentLog>> {
        Ok(self
            .state
            .lock()
            .await
            .logs_for(payment_id)
            .into_iter()
            .cloned()
            .collect())
    }

    async fn append_log(&self, entry: NewPaymentLog) -> AppResult<()> {
        self.state.lock().await.push_log(entry);
        Ok(())
    }
}

pub struct MemoryTx {
    shared: Arc<Mutex<LedgerState>>,
    guard: Option<OwnedMutexGuard<LedgerState>>,
    working: Option<LedgerState>,
}

impl MemoryTx {
    /// Take the store-wide lock, waiting at most `wait`. Returns false on timeout.
    async fn acquire(&mut self, wait: Duration) -> bool {
        if self.guard.is_some() {
            return true;
        }
        match tokio::time::timeout(wait, self.shared.clone().lock_owned()).await {
            Ok(guard) => {
                self.working = Some(guard.clone());
                self.guard = Some(guard);
                true
            }
            Err(_) => false,
        }
    }

    async fn state(&mut self) -> AppResult<&mut LedgerState> {
        if !self.acquire(DEFAULT_WAIT).await {
            return Err(AppError::Internal("memory ledger lock timed out".into()));
        }
        self.working
            .as_mut()
            .ok_or_else(|| AppError::Internal("memory ledger has no working copy".into()))
    }

    fn payment_mut<'a>(state: &'a mut LedgerState, payment_id: Uuid) -> AppResult<&'a mut Payment> {
        state
            .payments
            .get_mut(&payment_id)
            .ok_or_else(|| AppError::NotFound(format!("payment {}", payment_id)))
    }
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn lock_payment_by_reference(
        &mut self,
        reference: &str,
        wait: Duration,
    ) -> AppResult<LockOutcome<Payment>> {
        if !self.acquire(wait).await {
            return Ok(LockOutcome::Contended);
        }
        let state = self.state().await?;
        Ok(match state.payment_by_reference(reference) {
            Some(p) => LockOutcome::Acquired(p.clone()),
            None => LockOutcome::Missing,
        })
    }

    async fn lock_payment(
        &mut self,
        payment_id: Uuid,
        wait: Duration,
    ) -> AppResult<LockOutcome<Payment>> {
        if !self.acquire(wait).await {
            return Ok(LockOutcome::Contended);
        }
        let state = self.state().await?;
        Ok(match state.payments.get(&payment_id) {
            Some(p) => LockOutcome::Acquired(p.clone()),
            None => LockOutcome::Missing,
        })
    }

    async fn lock_unit(&mut self, unit_id: Uuid, wait: Duration) -> AppResult<LockOutcome<Unit>> {
        if !self.acquire(wait).await {
            return Ok(LockOutcome::Contended);
        }
        let state = self.state().await?;
        Ok(match state.units.get(&unit_id) {
            Some(u) => LockOutcome::Acquired(u.clone()),
            None => LockOutcome::Missing,
        })
    }

    async fn get_offer(&mut self, offer_id: Uuid) -> AppResult<Option<Offer>> {
        Ok(self.state().await?.offers.get(&offer_id).cloned())
    }

    async fn get_offer_by_token(&mut self, token: &str) -> AppResult<Option<Offer>> {
        Ok(self
            .state()
            .await?
            .offers
            .values()
            .find(|o| o.token == token)
            .cloned())
    }

    async fn list_unit_offers(&mut self, unit_id: Uuid) -> AppResult<Vec<Offer>> {
        let mut offers: Vec<Offer> = self
            .state()
            .await?
            .offers
            .values()
            .filter(|o| o.unit_id == unit_id)
            .cloned()
            .collect();
        offers.sort_by_key(|o| o.created_at);
        Ok(offers)
    }

    async fn complete_payment(
        &mut self,
        payment_id: Uuid,
        method: Option<String>,
        paid_at: DateTime<Utc>,
        metadata: serde_json::Value,
    ) -> AppResult<()> {
        let payment = Self::payment_mut(self.state().await?, payment_id)?;
        if payment.status != PaymentStatus::Pending {
            return Err(AppError::InvalidState {
                current: payment.status.as_str().into(),
                expected: "pending".into(),
            });
        }
        payment.status = PaymentStatus::Completed;
        payment.method = method;
        payment.paid_at = Some(paid_at);
        payment.metadata = Some(metadata);
        payment.updated_at = Utc::now();
        Ok(())
    }

    async fn fail_payment(
        &mut self,
        payment_id: Uuid,
        metadata: Option<serde_json::Value>,
    ) -> AppResult<()> {
        let payment = Self::payment_mut(self.state().await?, payment_id)?;
        if payment.status != PaymentStatus::Pending {
            return Err(AppError::InvalidState {
                current: payment.status.as_str().into(),
                expected: "pending".into(),
            });
        }
        payment.status = PaymentStatus::Failed;
        if metadata.is_some() {
            payment.metadata = metadata;
        }
        payment.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_payment_refunded(&mut self, payment_id: Uuid) -> AppResult<()> {
        let payment = Self::payment_mut(self.state().await?, payment_id)?;
        if payment.status != PaymentStatus::Completed {
            return Err(AppError::InvalidState {
                current: payment.status.as_str().into(),
                expected: "completed".into(),
            });
        }
        payment.status = PaymentStatus::Refunded;
        payment.updated_at = Utc::now();
        Ok(())
    }

    async fn apply_offer_ledger(&mut self, offer_id: Uuid, update: &LedgerUpdate) -> AppResult<()> {
        let offer = self
            .state()
            .await?
            .offers
            .get_mut(&offer_id)
            .ok_or_else(|| AppError::NotFound(format!("offer {}", offer_id)))?;
        offer.amount_paid = update.amount_paid;
        offer.outstanding_balance = update.outstanding_balance;
        offer.payment_status = update.payment_status;
        offer.updated_at = Utc::now();
        Ok(())
    }

    async fn set_offer_status(
        &mut self,
        offer_id: Uuid,
        status: OfferStatus,
        selected_at: Option<DateTime<Utc>>,
    ) -> AppResult<()> {
        let offer = self
            .state()
            .await?
            .offers
            .get_mut(&offer_id)
            .ok_or_else(|| AppError::NotFound(format!("offer {}", offer_id)))?;
        offer.status = status;
        if selected_at.is_some() {
            offer.selected_at = selected_at;
        }
        offer.updated_at = Utc::now();
        Ok(())
    }

    async fn set_unit_status(&mut self, unit: &Unit, to: UnitStatus) -> AppResult<()> {
        unit.status.validate_transition(to)?;
        let stored = self
            .state()
            .await?
            .units
            .get_mut(&unit.id)
            .ok_or_else(|| AppError::NotFound(format!("unit {}", unit.id)))?;
        if stored.status != unit.status {
            return Err(AppError::InvalidState {
                current: format!("{:?}", stored.status),
                expected: format!("{:?}", unit.status),
            });
        }
        stored.status = to;
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn append_log(&mut self, entry: NewPaymentLog) -> AppResult<()> {
        self.state().await?.push_log(entry);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> AppResult<()> {
        let MemoryTx { guard, working, .. } = *self;
        if let (Some(mut guard), Some(working)) = (guard, working) {
            *guard = working;
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> AppResult<()> {
        Ok(())
    }
}
