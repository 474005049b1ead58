// Payment gateway seam: initialize a hosted checkout and verify it later
pub mod client;

#[cfg(test)]
pub mod fake;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// Transaction parameters sent to the provider
#[derive(Debug, Clone, Serialize)]
pub struct InitializeRequest {
    pub email: String,
    /// Amount in minor currency units (kobo, cents)
    pub amount_minor: i64,
    pub reference: String,
    pub callback_url: Option<String>,
}

/// Hosted checkout handle returned by the provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializedTransaction {
    pub access_code: String,
    pub access_url: String,
}

/// Provider-side outcome of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayStatus {
    Success,
    Failed,
    Pending,
}

impl GatewayStatus {
    /// Map the provider's free-form status string.
    /// Only `failed` and `reversed` are final failures. `abandoned` means the payer
    /// has not finished checkout yet, so it stays pending with everything else.
    pub fn from_provider(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "success" => GatewayStatus::Success,
            "failed" | "reversed" => GatewayStatus::Failed,
            _ => GatewayStatus::Pending,
        }
    }
}

/// A verified gateway result, identical regardless of which channel produced it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayResult {
    pub reference: String,
    pub status: GatewayStatus,
    /// Amount the provider reports, in major units
    pub amount: Option<Decimal>,
    pub paid_at: Option<DateTime<Utc>>,
    /// Payment method, e.g. card or bank_transfer
    pub channel: Option<String>,
    /// Last provider payload, kept for audit
    pub raw: serde_json::Value,
}

impl GatewayResult {
    pub fn pending(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            status: GatewayStatus::Pending,
            amount: None,
            paid_at: None,
            channel: None,
            raw: serde_json::Value::Null,
        }
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn initialize(
        &self,
        request: InitializeRequest,
    ) -> Result<InitializedTransaction, GatewayError>;

    async fn verify(&self, reference: &str) -> Result<GatewayResult, GatewayError>;
}

/// Major units to minor units. `None` when the amount does not fit.
pub fn to_minor_units(amount: Decimal) -> Option<i64> {
    (amount * Decimal::ONE_HUNDRED).round().to_i64()
}

pub fn from_minor_units(minor: i64) -> Decimal {
    Decimal::new(minor, 2)
}
