use super::models::*;
use super::{InsertOutcome, LedgerStore, LedgerTx, LockOutcome, RefundOwed};
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// SQLSTATE raised when `lock_timeout` expires
const LOCK_NOT_AVAILABLE: &str = "55P03";

const PAYMENT_COLUMNS: &str = r#"
    id, offer_id, amount, payment_type, status, external_reference,
    method, paid_at, metadata, created_at, updated_at
"#;

const OFFER_COLUMNS: &str = r#"
    id, unit_id, landlord_id, applicant_id, token, total_amount, amount_paid,
    outstanding_balance, payment_status, status, selected_at, created_at, updated_at
"#;

/// Ledger repository - THE source of truth for all settlement state
pub struct LedgerRepository {
    pub pool: PgPool,
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn is_lock_timeout(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(LOCK_NOT_AVAILABLE),
        _ => false,
    }
}

#[async_trait]
impl LedgerStore for LedgerRepository {
    async fn begin(&self) -> AppResult<Box<dyn LedgerTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(LedgerTransaction { tx }))
    }

    async fn ping(&self) -> AppResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn get_offer_by_token(&self, token: &str) -> AppResult<Option<Offer>> {
        let row = sqlx::query(&format!("SELECT {} FROM offers WHERE token = $1", OFFER_COLUMNS))
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Offer::from_row).transpose()
    }

    async fn get_unit(&self, unit_id: Uuid) -> AppResult<Option<Unit>> {
        let row = sqlx::query("SELECT id, status, updated_at FROM units WHERE id = $1")
            .bind(unit_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Unit::from_row).transpose()
    }

    async fn get_payment_by_reference(&self, reference: &str) -> AppResult<Option<Payment>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM payments WHERE external_reference = $1",
            PAYMENT_COLUMNS
        ))
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Payment::from_row).transpose()
    }

    async fn reference_exists(&self, reference: &str) -> AppResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM payments WHERE external_reference = $1)",
        )
        .bind(reference)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn insert_payment(&self, payment: NewPayment) -> AppResult<InsertOutcome> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO payments (offer_id, amount, payment_type, status, external_reference, metadata)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (external_reference) DO NOTHING
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(payment.offer_id)
        .bind(payment.amount)
        .bind(payment.payment_type)
        .bind(PaymentStatus::Pending)
        .bind(&payment.external_reference)
        .bind(&payment.metadata)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(InsertOutcome::Inserted(Payment::from_row(&row)?)),
            None => {
                warn!(
                    "Payment reference collision on insert: {}",
                    payment.external_reference
                );
                Ok(InsertOutcome::Conflict)
            }
        }
    }

    async fn list_stale_pending(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<Payment>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM payments
            WHERE status = $1 AND created_at < $2
            ORDER BY updated_at ASC, created_at ASC
            LIMIT $3
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(PaymentStatus::Pending)
        .bind(created_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Payment::from_row).collect()
    }

    async fn touch_payment(&self, payment_id: Uuid) -> AppResult<()> {
        sqlx::query("UPDATE payments SET updated_at = NOW() WHERE id = $1 AND status = $2")
            .bind(payment_id)
            .bind(PaymentStatus::Pending)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_refunds_owed(&self) -> AppResult<Vec<RefundOwed>> {
        let rows = sqlx::query(
            r#"
            SELECT p.id, p.offer_id, p.amount, p.payment_type, p.status, p.external_reference,
                   p.method, p.paid_at, p.metadata, p.created_at, p.updated_at
            FROM payments p
            JOIN offers o ON o.id = p.offer_id
            WHERE p.status = $1
              AND (
                o.status = $2 OR o.status = $3
                OR EXISTS (
                    SELECT 1 FROM payment_logs l
                    WHERE l.payment_id = p.id AND l.event_type = $4
                )
              )
            ORDER BY p.paid_at ASC
            "#,
        )
        .bind(PaymentStatus::Completed)
        .bind(OfferStatus::RejectedByPayment)
        .bind(OfferStatus::PaymentHeldRaceCondition)
        .bind(PaymentLogEvent::Overpaid)
        .fetch_all(&self.pool)
        .await?;

        let payments = rows
            .iter()
            .map(Payment::from_row)
            .collect::<AppResult<Vec<_>>>()?;

        if payments.is_empty() {
            return Ok(Vec::new());
        }

        let offer_ids: Vec<Uuid> = payments.iter().map(|p| p.offer_id).collect();
        let offer_rows = sqlx::query(&format!(
            "SELECT {} FROM offers WHERE id = ANY($1)",
            OFFER_COLUMNS
        ))
        .bind(&offer_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut offers = HashMap::new();
        for row in &offer_rows {
            let offer = Offer::from_row(row)?;
            offers.insert(offer.id, offer);
        }

        payments
            .into_iter()
            .map(|payment| {
                let offer = offers.get(&payment.offer_id).cloned().ok_or_else(|| {
                    AppError::Internal(format!("Offer {} missing for payment", payment.offer_id))
                })?;
                Ok(RefundOwed { payment, offer })
            })
            .collect()
    }

    async fn list_payment_logs(&self, payment_id: Uuid) -> AppResult<Vec<PaymentLog>> {
        use sqlx::Row;

        let rows = sqlx::query(
            r#"
            SELECT id, payment_id, event_type, payload, created_at
            FROM payment_logs
            WHERE payment_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(payment_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> AppResult<PaymentLog> {
                Ok(PaymentLog {
                    id: row.try_get("id")?,
                    payment_id: row.try_get("payment_id")?,
                    event_type: row.try_get("event_type")?,
                    payload: row.try_get("payload")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn append_log(&self, entry: NewPaymentLog) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO payment_logs (payment_id, event_type, payload) VALUES ($1, $2, $3)",
        )
        .bind(entry.payment_id)
        .bind(entry.event_type)
        .bind(&entry.payload)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Postgres transaction with bounded-wait row locking
pub struct LedgerTransaction {
    tx: Transaction<'static, Postgres>,
}

impl LedgerTransaction {
    /// `SET LOCAL lock_timeout` for the remainder of this transaction
    async fn set_lock_wait(&mut self, wait: Duration) -> AppResult<()> {
        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", wait.as_millis().max(1)))
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn lock_payment_where(
        &mut self,
        predicate: &str,
        key: PaymentKey<'_>,
        wait: Duration,
    ) -> AppResult<LockOutcome<Payment>> {
        self.set_lock_wait(wait).await?;

        // Plain single-table lock: joining here makes FOR UPDATE apply to outer-joined rows
        let sql = format!(
            "SELECT {} FROM payments WHERE {} FOR UPDATE",
            PAYMENT_COLUMNS, predicate
        );
        let query = sqlx::query(&sql);
        let query = match key {
            PaymentKey::Reference(reference) => query.bind(reference),
            PaymentKey::Id(id) => query.bind(id),
        };

        match query.fetch_optional(&mut *self.tx).await {
            Ok(Some(row)) => Ok(LockOutcome::Acquired(Payment::from_row(&row)?)),
            Ok(None) => Ok(LockOutcome::Missing),
            Err(e) if is_lock_timeout(&e) => {
                debug!("Payment row lock contended ({})", predicate);
                Ok(LockOutcome::Contended)
            }
            Err(e) => Err(e.into()),
        }
    }
}

enum PaymentKey<'a> {
    Reference(&'a str),
    Id(Uuid),
}

#[async_trait]
impl LedgerTx for LedgerTransaction {
    async fn lock_payment_by_reference(
        &mut self,
        reference: &str,
        wait: Duration,
    ) -> AppResult<LockOutcome<Payment>> {
        self.lock_payment_where("external_reference = $1", PaymentKey::Reference(reference), wait)
            .await
    }

    async fn lock_payment(
        &mut self,
        payment_id: Uuid,
        wait: Duration,
    ) -> AppResult<LockOutcome<Payment>> {
        self.lock_payment_where("id = $1", PaymentKey::Id(payment_id), wait)
            .await
    }

    async fn lock_unit(&mut self, unit_id: Uuid, wait: Duration) -> AppResult<LockOutcome<Unit>> {
        self.set_lock_wait(wait).await?;

        let result = sqlx::query("SELECT id, status, updated_at FROM units WHERE id = $1 FOR UPDATE")
            .bind(unit_id)
            .fetch_optional(&mut *self.tx)
            .await;

        match result {
            Ok(Some(row)) => Ok(LockOutcome::Acquired(Unit::from_row(&row)?)),
            Ok(None) => Ok(LockOutcome::Missing),
            Err(e) if is_lock_timeout(&e) => {
                debug!("Unit row lock contended: {}", unit_id);
                Ok(LockOutcome::Contended)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_offer(&mut self, offer_id: Uuid) -> AppResult<Option<Offer>> {
        let row = sqlx::query(&format!("SELECT {} FROM offers WHERE id = $1", OFFER_COLUMNS))
            .bind(offer_id)
            .fetch_optional(&mut *self.tx)
            .await?;

        row.as_ref().map(Offer::from_row).transpose()
    }

    async fn get_offer_by_token(&mut self, token: &str) -> AppResult<Option<Offer>> {
        let row = sqlx::query(&format!("SELECT {} FROM offers WHERE token = $1", OFFER_COLUMNS))
            .bind(token)
            .fetch_optional(&mut *self.tx)
            .await?;

        row.as_ref().map(Offer::from_row).transpose()
    }

    async fn list_unit_offers(&mut self, unit_id: Uuid) -> AppResult<Vec<Offer>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM offers WHERE unit_id = $1 ORDER BY created_at ASC",
            OFFER_COLUMNS
        ))
        .bind(unit_id)
        .fetch_all(&mut *self.tx)
        .await?;

        rows.iter().map(Offer::from_row).collect()
    }

    async fn complete_payment(
        &mut self,
        payment_id: Uuid,
        method: Option<String>,
        paid_at: DateTime<Utc>,
        metadata: serde_json::Value,
    ) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE payments
            SET status = $2, method = $3, paid_at = $4, metadata = $5, updated_at = NOW()
            WHERE id = $1 AND status = $6
            "#,
        )
        .bind(payment_id)
        .bind(PaymentStatus::Completed)
        .bind(method)
        .bind(paid_at)
        .bind(metadata)
        .bind(PaymentStatus::Pending)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::InvalidState {
                current: "not pending".to_string(),
                expected: "pending".to_string(),
            });
        }

        Ok(())
    }

    async fn fail_payment(
        &mut self,
        payment_id: Uuid,
        metadata: Option<serde_json::Value>,
    ) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE payments
            SET status = $2, metadata = COALESCE($3, metadata), updated_at = NOW()
            WHERE id = $1 AND status = $4
            "#,
        )
        .bind(payment_id)
        .bind(PaymentStatus::Failed)
        .bind(metadata)
        .bind(PaymentStatus::Pending)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::InvalidState {
                current: "not pending".to_string(),
                expected: "pending".to_string(),
            });
        }

        Ok(())
    }

    async fn mark_payment_refunded(&mut self, payment_id: Uuid) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE payments SET status = $2, updated_at = NOW() WHERE id = $1 AND status = $3",
        )
        .bind(payment_id)
        .bind(PaymentStatus::Refunded)
        .bind(PaymentStatus::Completed)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::InvalidState {
                current: "not completed".to_string(),
                expected: "completed".to_string(),
            });
        }

        Ok(())
    }

    async fn apply_offer_ledger(&mut self, offer_id: Uuid, update: &LedgerUpdate) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE offers
            SET amount_paid = $2, outstanding_balance = $3, payment_status = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(offer_id)
        .bind(update.amount_paid)
        .bind(update.outstanding_balance)
        .bind(update.payment_status)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn set_offer_status(
        &mut self,
        offer_id: Uuid,
        status: OfferStatus,
        selected_at: Option<DateTime<Utc>>,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE offers
            SET status = $2, selected_at = COALESCE($3, selected_at), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(offer_id)
        .bind(status)
        .bind(selected_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn set_unit_status(&mut self, unit: &Unit, to: UnitStatus) -> AppResult<()> {
        unit.status.validate_transition(to)?;

        let result = sqlx::query(
            "UPDATE units SET status = $2, updated_at = NOW() WHERE id = $1 AND status = $3",
        )
        .bind(unit.id)
        .bind(to)
        .bind(unit.status)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::InvalidState {
                current: "unit changed underneath lock".to_string(),
                expected: format!("{:?}", unit.status),
            });
        }

        Ok(())
    }

    async fn append_log(&mut self, entry: NewPaymentLog) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO payment_logs (payment_id, event_type, payload) VALUES ($1, $2, $3)",
        )
        .bind(entry.payment_id)
        .bind(entry.event_type)
        .bind(&entry.payload)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> AppResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> AppResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
