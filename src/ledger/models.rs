use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::Type;
use std::fmt;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Payment kind, fixed at initiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "payment_type", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentType {
    Partial,
    Full,
}

impl PaymentType {
    /// FULL when the amount covers everything still owed
    pub fn classify(amount: Decimal, outstanding: Decimal) -> Self {
        if amount >= outstanding {
            PaymentType::Full
        } else {
            PaymentType::Partial
        }
    }
}

/// Payment status state machine
///
/// Pending → Completed | Failed. Completed → Refunded only through the refund desk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "payment_status", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }
}

/// Derived from amount_paid/outstanding_balance, never set independently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "offer_payment_status", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OfferPaymentStatus {
    Unpaid,
    Partial,
    FullyPaid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "offer_status", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OfferStatus {
    Pending,
    Accepted,
    Rejected,
    Selected,
    RejectedByPayment,
    PaymentHeldRaceCondition,
}

impl OfferStatus {
    /// Statuses the allocation sweep never touches again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OfferStatus::Rejected
                | OfferStatus::Selected
                | OfferStatus::RejectedByPayment
                | OfferStatus::PaymentHeldRaceCondition
        )
    }

    /// Offers whose completed payments must be handed back
    pub fn owes_refund(&self) -> bool {
        matches!(
            self,
            OfferStatus::RejectedByPayment | OfferStatus::PaymentHeldRaceCondition
        )
    }
}

impl fmt::Display for OfferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "unit_status", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitStatus {
    Vacant,
    OfferAccepted,
    Occupied,
}

impl UnitStatus {
    /// Validate unit status transitions
    /// Valid transitions:
    /// - Vacant → OfferAccepted, Occupied
    /// - OfferAccepted → Occupied, Vacant (offer rejected before any payment completed)
    /// - Occupied → NO TRANSITIONS ALLOWED
    pub fn validate_transition(self, to: UnitStatus) -> AppResult<()> {
        let allowed = match self {
            UnitStatus::Vacant => vec![UnitStatus::OfferAccepted, UnitStatus::Occupied],
            UnitStatus::OfferAccepted => vec![UnitStatus::Occupied, UnitStatus::Vacant],
            UnitStatus::Occupied => vec![],
        };

        if !allowed.contains(&to) {
            return Err(AppError::InvalidState {
                current: format!("unit {:?}", self),
                expected: format!("one of {:?}", allowed),
            });
        }

        Ok(())
    }
}

/// Payment entity - one attempt to pay toward an offer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub offer_id: Uuid,
    pub amount: Decimal,
    pub payment_type: PaymentType,
    pub status: PaymentStatus,
    /// Idempotency key shared by every verification channel
    pub external_reference: String,
    pub method: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    pub fn from_row(row: &sqlx::postgres::PgRow) -> AppResult<Self> {
        use sqlx::Row;

        Ok(Payment {
            id: row.try_get("id")?,
            offer_id: row.try_get("offer_id")?,
            amount: row.try_get("amount")?,
            payment_type: row.try_get("payment_type")?,
            status: row.try_get("status")?,
            external_reference: row.try_get("external_reference")?,
            method: row.try_get("method")?,
            paid_at: row.try_get("paid_at")?,
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Values needed to persist a freshly initialized payment
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub offer_id: Uuid,
    pub amount: Decimal,
    pub payment_type: PaymentType,
    pub external_reference: String,
    pub metadata: serde_json::Value,
}

/// Offer entity - a landlord's conditional commitment to rent a unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    pub id: Uuid,
    pub unit_id: Uuid,
    pub landlord_id: Uuid,
    pub applicant_id: Uuid,
    pub token: String,
    pub total_amount: Decimal,
    pub amount_paid: Decimal,
    pub outstanding_balance: Decimal,
    pub payment_status: OfferPaymentStatus,
    pub status: OfferStatus,
    pub selected_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Ledger figures after applying one completed payment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerUpdate {
    pub amount_paid: Decimal,
    pub outstanding_balance: Decimal,
    pub payment_status: OfferPaymentStatus,
}

impl LedgerUpdate {
    pub fn is_fully_paid(&self) -> bool {
        self.payment_status == OfferPaymentStatus::FullyPaid
    }
}

impl Offer {
    pub fn from_row(row: &sqlx::postgres::PgRow) -> AppResult<Self> {
        use sqlx::Row;

        Ok(Offer {
            id: row.try_get("id")?,
            unit_id: row.try_get("unit_id")?,
            landlord_id: row.try_get("landlord_id")?,
            applicant_id: row.try_get("applicant_id")?,
            token: row.try_get("token")?,
            total_amount: row.try_get("total_amount")?,
            amount_paid: row.try_get("amount_paid")?,
            outstanding_balance: row.try_get("outstanding_balance")?,
            payment_status: row.try_get("payment_status")?,
            status: row.try_get("status")?,
            selected_at: row.try_get("selected_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    /// Compute the ledger after `amount` completes.
    ///
    /// Outstanding is clamped at zero; anything under `epsilon` counts as fully paid.
    pub fn apply_payment(&self, amount: Decimal, epsilon: Decimal) -> LedgerUpdate {
        let amount_paid = self.amount_paid + amount;
        let outstanding = (self.total_amount - amount_paid).max(Decimal::ZERO);

        let payment_status = if outstanding < epsilon {
            OfferPaymentStatus::FullyPaid
        } else if amount_paid > Decimal::ZERO {
            OfferPaymentStatus::Partial
        } else {
            OfferPaymentStatus::Unpaid
        };

        let outstanding_balance = if payment_status == OfferPaymentStatus::FullyPaid {
            Decimal::ZERO
        } else {
            outstanding
        };

        LedgerUpdate {
            amount_paid,
            outstanding_balance,
            payment_status,
        }
    }
}

/// Unit entity - the rentable property being contended for
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unit {
    pub id: Uuid,
    pub status: UnitStatus,
    pub updated_at: DateTime<Utc>,
}

impl Unit {
    pub fn from_row(row: &sqlx::postgres::PgRow) -> AppResult<Self> {
        use sqlx::Row;

        Ok(Unit {
            id: row.try_get("id")?,
            status: row.try_get("status")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Payment log event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "payment_log_event", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentLogEvent {
    Initiated,
    Completed,
    Failed,
    Expired,
    RaceConditionHeld,
    RejectedByPayment,
    Overpaid,
    LateSuccessIgnored,
    Refunded,
}

/// Append-only audit entry for a payment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentLog {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub event_type: PaymentLogEvent,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPaymentLog {
    pub payment_id: Uuid,
    pub event_type: PaymentLogEvent,
    pub payload: serde_json::Value,
}

impl NewPaymentLog {
    pub fn new(payment_id: Uuid, event_type: PaymentLogEvent, payload: serde_json::Value) -> Self {
        Self {
            payment_id,
            event_type,
            payload,
        }
    }
}
