// Ledger store: the source of truth for payments, offers and units
pub mod models;
pub mod repository;

#[cfg(test)]
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::error::AppResult;
use models::*;

pub use repository::LedgerRepository;

/// Result of a bounded-wait row lock
#[derive(Debug)]
pub enum LockOutcome<T> {
    Acquired(T),
    /// No row with that key
    Missing,
    /// Another transaction holds the row past the wait budget
    Contended,
}

/// Result of inserting a payment keyed by its external reference
#[derive(Debug)]
pub enum InsertOutcome {
    Inserted(Payment),
    /// The reference is already taken
    Conflict,
}

/// A completed payment whose money must be handed back
#[derive(Debug, Clone, serde::Serialize)]
pub struct RefundOwed {
    pub payment: Payment,
    pub offer: Offer,
}

/// Non-transactional ledger access plus the entry point for transactions
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn begin(&self) -> AppResult<Box<dyn LedgerTx>>;

    async fn ping(&self) -> AppResult<()>;

    async fn get_offer_by_token(&self, token: &str) -> AppResult<Option<Offer>>;

    async fn get_unit(&self, unit_id: Uuid) -> AppResult<Option<Unit>>;

    async fn get_payment_by_reference(&self, reference: &str) -> AppResult<Option<Payment>>;

    async fn reference_exists(&self, reference: &str) -> AppResult<bool>;

    /// Persist a PENDING payment. A duplicate reference is a `Conflict`, not an error.
    async fn insert_payment(&self, payment: NewPayment) -> AppResult<InsertOutcome>;

    /// PENDING payments created before `created_before`, least recently touched first
    async fn list_stale_pending(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<Payment>>;

    /// Bump `updated_at` on a PENDING payment so it queues behind its peers
    async fn touch_payment(&self, payment_id: Uuid) -> AppResult<()>;

    async fn list_refunds_owed(&self) -> AppResult<Vec<RefundOwed>>;

    async fn list_payment_logs(&self, payment_id: Uuid) -> AppResult<Vec<PaymentLog>>;

    async fn append_log(&self, entry: NewPaymentLog) -> AppResult<()>;
}

/// One ledger transaction.
///
/// Locks are taken in the order payment → unit and released on commit/rollback.
/// Offer rows are only mutated while their unit row is locked.
#[async_trait]
pub trait LedgerTx: Send {
    async fn lock_payment_by_reference(
        &mut self,
        reference: &str,
        wait: Duration,
    ) -> AppResult<LockOutcome<Payment>>;

    async fn lock_payment(
        &mut self,
        payment_id: Uuid,
        wait: Duration,
    ) -> AppResult<LockOutcome<Payment>>;

    async fn lock_unit(&mut self, unit_id: Uuid, wait: Duration) -> AppResult<LockOutcome<Unit>>;

    async fn get_offer(&mut self, offer_id: Uuid) -> AppResult<Option<Offer>>;

    async fn get_offer_by_token(&mut self, token: &str) -> AppResult<Option<Offer>>;

    async fn list_unit_offers(&mut self, unit_id: Uuid) -> AppResult<Vec<Offer>>;

    async fn complete_payment(
        &mut self,
        payment_id: Uuid,
        method: Option<String>,
        paid_at: DateTime<Utc>,
        metadata: serde_json::Value,
    ) -> AppResult<()>;

    async fn fail_payment(
        &mut self,
        payment_id: Uuid,
        metadata: Option<serde_json::Value>,
    ) -> AppResult<()>;

    async fn mark_payment_refunded(&mut self, payment_id: Uuid) -> AppResult<()>;

    async fn apply_offer_ledger(&mut self, offer_id: Uuid, update: &LedgerUpdate) -> AppResult<()>;

    async fn set_offer_status(
        &mut self,
        offer_id: Uuid,
        status: OfferStatus,
        selected_at: Option<DateTime<Utc>>,
    ) -> AppResult<()>;

    /// Move a locked unit forward; rejects transitions the unit state machine forbids
    async fn set_unit_status(&mut self, unit: &Unit, to: UnitStatus) -> AppResult<()>;

    async fn append_log(&mut self, entry: NewPaymentLog) -> AppResult<()>;

    async fn commit(self: Box<Self>) -> AppResult<()>;

    async fn rollback(self: Box<Self>) -> AppResult<()>;
}
