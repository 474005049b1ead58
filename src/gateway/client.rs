use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{
    from_minor_units, GatewayResult, GatewayStatus, InitializeRequest, InitializedTransaction,
    PaymentGateway,
};
use crate::config::GatewayConfig;
use crate::error::GatewayError;

/// Paystack-compatible REST client
pub struct PaystackClient {
    base_url: String,
    secret_key: String,
    max_attempts: u32,
    backoff: Duration,
    client: Client,
}

/// Every provider response is wrapped in the same envelope
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: bool,
    message: String,
    data: Option<T>,
}

#[derive(Debug, Serialize)]
struct InitializeBody<'a> {
    email: &'a str,
    amount: i64,
    reference: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    callback_url: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct InitializeData {
    authorization_url: String,
    access_code: String,
}

#[derive(Debug, Deserialize)]
struct VerifyData {
    reference: String,
    status: String,
    amount: Option<i64>,
    paid_at: Option<DateTime<Utc>>,
    channel: Option<String>,
}

impl PaystackClient {
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            secret_key: config.secret_key.clone(),
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_millis(config.backoff_ms),
            client,
        })
    }

    /// Run `call` up to `max_attempts` times with linear backoff.
    /// Non-retryable errors are returned immediately.
    async fn with_retries<T, F, Fut>(&self, operation: &str, call: F) -> Result<T, GatewayError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= self.max_attempts => {
                    return Err(GatewayError::Exhausted {
                        attempts: attempt,
                        last_error: e.to_string(),
                    })
                }
                Err(e) => {
                    let delay = self.backoff * attempt;
                    warn!(
                        "⚠️ Gateway {} failed (attempt {}/{}): {}. Retrying in {:?}",
                        operation, attempt, self.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn read_envelope<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> Result<(T, serde_json::Value), GatewayError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                message: body,
            });
        }

        let raw: serde_json::Value =
            serde_json::from_str(&body).map_err(|e| GatewayError::Malformed(e.to_string()))?;
        let envelope: Envelope<T> = serde_json::from_value(raw.clone())
            .map_err(|e| GatewayError::Malformed(e.to_string()))?;

        if !envelope.status {
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                message: envelope.message,
            });
        }

        let data = envelope
            .data
            .ok_or_else(|| GatewayError::Malformed("response has no data".into()))?;
        Ok((data, raw))
    }

    async fn initialize_once(
        &self,
        request: &InitializeRequest,
    ) -> Result<InitializedTransaction, GatewayError> {
        let body = InitializeBody {
            email: &request.email,
            amount: request.amount_minor,
            reference: &request.reference,
            callback_url: request.callback_url.as_deref(),
        };

        let response = self
            .client
            .post(format!("{}/transaction/initialize", self.base_url))
            .bearer_auth(&self.secret_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        let (data, _) = Self::read_envelope::<InitializeData>(response).await?;
        Ok(InitializedTransaction {
            access_code: data.access_code,
            access_url: data.authorization_url,
        })
    }

    async fn verify_once(&self, reference: &str) -> Result<GatewayResult, GatewayError> {
        let response = self
            .client
            .get(format!("{}/transaction/verify/{}", self.base_url, reference))
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        let (data, raw) = Self::read_envelope::<VerifyData>(response).await?;
        debug!("Gateway verify {} -> {}", data.reference, data.status);

        Ok(GatewayResult {
            status: GatewayStatus::from_provider(&data.status),
            reference: data.reference,
            amount: data.amount.map(from_minor_units),
            paid_at: data.paid_at,
            channel: data.channel,
            raw,
        })
    }
}

#[async_trait]
impl PaymentGateway for PaystackClient {
    async fn initialize(
        &self,
        request: InitializeRequest,
    ) -> Result<InitializedTransaction, GatewayError> {
        let request = &request;
        let transaction = self
            .with_retries("initialize", || self.initialize_once(request))
            .await?;
        info!("✓ Gateway transaction initialized: {}", request.reference);
        Ok(transaction)
    }

    async fn verify(&self, reference: &str) -> Result<GatewayResult, GatewayError> {
        self.with_retries("verify", || self.verify_once(reference)).await
    }
}
