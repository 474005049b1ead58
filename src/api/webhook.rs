use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha512;
use std::sync::Arc;
use tokio::spawn;
use tracing::{error, info, warn};

use crate::dispatch::dispatcher::RetryPolicy;
use crate::error::AppResult;
use crate::gateway::{from_minor_units, GatewayResult, GatewayStatus};
use crate::settlement::{ReconcileOutcome, Reconciler, VerificationScheduler, VerificationSource};

type HmacSha512 = Hmac<Sha512>;

/// Header carrying the hex HMAC-SHA512 of the raw request body
pub const SIGNATURE_HEADER: &str = "x-paystack-signature";

/// Constant-time check of `signature` (hex) against the body's HMAC
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha512::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Provider push event
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub event: String,
    pub data: WebhookData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookData {
    pub reference: String,
    pub amount: Option<i64>,
    pub paid_at: Option<String>,
    pub channel: Option<String>,
}

impl WebhookEvent {
    /// Charge events become gateway results; anything else is ignored
    pub fn into_gateway_result(self, raw: serde_json::Value) -> Option<GatewayResult> {
        let status = match self.event.as_str() {
            "charge.success" => GatewayStatus::Success,
            "charge.failed" => GatewayStatus::Failed,
            _ => return None,
        };

        let paid_at = self
            .data
            .paid_at
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc));

        Some(GatewayResult {
            reference: self.data.reference,
            status,
            amount: self.data.amount.map(from_minor_units),
            paid_at,
            channel: self.data.channel,
            raw,
        })
    }
}

/// Processes authenticated webhook events off the request path
pub struct WebhookProcessor {
    reconciler: Arc<Reconciler>,
    scheduler: VerificationScheduler,
    retry: RetryPolicy,
}

impl WebhookProcessor {
    pub fn new(
        reconciler: Arc<Reconciler>,
        scheduler: VerificationScheduler,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            reconciler,
            scheduler,
            retry,
        }
    }

    /// Queue `result` for background reconciliation and return immediately
    pub fn process_async(self: &Arc<Self>, result: GatewayResult) {
        let processor = self.clone();
        spawn(async move {
            if let Err(e) = processor.process(&result).await {
                error!("❌ Webhook processing failed for {}: {:?}", result.reference, e);
            }
        });
    }

    /// Reconcile with bounded retry on transient errors.
    /// Contention hands the reference to the polling worker.
    pub async fn process(&self, result: &GatewayResult) -> AppResult<ReconcileOutcome> {
        info!("⚙️ Processing webhook for {}", result.reference);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .reconciler
                .reconcile(result, VerificationSource::Webhook)
                .await
            {
                Ok(ReconcileOutcome::Contended) => {
                    self.scheduler.schedule(&result.reference);
                    return Ok(ReconcileOutcome::Contended);
                }
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    warn!(
                        "⚠️ Webhook for {} failed (attempt {}/{}): {}",
                        result.reference, attempt, self.retry.max_attempts, e
                    );
                    tokio::time::sleep(self.retry.backoff * attempt).await;
                }
                Err(e) => {
                    if e.is_transient() {
                        self.scheduler.schedule(&result.reference);
                    }
                    return Err(e);
                }
            }
        }
    }
}
