use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub gateway: GatewayConfig,
    pub verification: VerificationConfig,
    pub expiry: ExpiryConfig,
    pub settlement: SettlementConfig,
    pub dispatch: DispatchConfig,
    pub rate_limit: RateLimitConfig,
}

/// Payment provider credentials and retry policy
#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub secret_key: String,
    /// Shared secret used to sign webhook bodies; falls back to `secret_key`
    pub webhook_secret: Option<String>,
    pub request_timeout_secs: u64,
    pub max_attempts: u32,
    /// Linear backoff step between attempts
    pub backoff_ms: u64,
}

impl GatewayConfig {
    /// Signing secret for webhook bodies, `None` when neither key is set
    pub fn webhook_secret(&self) -> Option<&str> {
        self.webhook_secret
            .as_deref()
            .filter(|secret| !secret.is_empty())
            .or_else(|| Some(self.secret_key.as_str()).filter(|secret| !secret.is_empty()))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Polling schedule for freshly initiated payments
#[derive(Debug, Deserialize, Clone)]
pub struct VerificationConfig {
    pub initial_delay_secs: u64,
    pub interval_secs: u64,
    pub max_attempts: u32,
    pub queue_capacity: usize,
}

impl VerificationConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExpiryConfig {
    pub sweep_interval_secs: u64,
    /// Age after which a PENDING payment is closed by the sweeper
    pub pending_timeout_secs: i64,
    pub batch_size: i64,
    pub concurrency: usize,
}

impl ExpiryConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn pending_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.pending_timeout_secs)
    }

    /// Past this age a payment is expired even if the provider cannot be reached
    pub fn hard_timeout(&self) -> chrono::Duration {
        self.pending_timeout() * 2
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SettlementConfig {
    /// Bounded wait for payment/unit row locks
    pub lock_wait_ms: u64,
    /// Remaining balance below this counts as fully paid
    pub fully_paid_epsilon: Decimal,
}

impl SettlementConfig {
    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            lock_wait_ms: 2_000,
            fully_paid_epsilon: Decimal::new(1, 2),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatchConfig {
    pub queue_capacity: usize,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    /// Base URL of the notification/history/tenancy collaborator service.
    /// When unset, side effects are only logged.
    pub collaborator_url: Option<String>,
    pub collaborator_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    pub requests: u32,
    pub per_seconds: u64,
}

impl Config {
    /// Build configuration from defaults overridden by environment variables.
    ///
    /// Nested keys use a double underscore, e.g. `GATEWAY__SECRET_KEY` or
    /// `EXPIRY__PENDING_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .set_default("database_url", "postgresql://localhost/offer_settlement")?
            .set_default("bind_address", "0.0.0.0:8080")?
            .set_default("gateway.base_url", "https://api.paystack.co")?
            .set_default("gateway.secret_key", "")?
            .set_default("gateway.request_timeout_secs", 15)?
            .set_default("gateway.max_attempts", 3)?
            .set_default("gateway.backoff_ms", 500)?
            .set_default("verification.initial_delay_secs", 30)?
            .set_default("verification.interval_secs", 180)?
            .set_default("verification.max_attempts", 10)?
            .set_default("verification.queue_capacity", 4096)?
            .set_default("expiry.sweep_interval_secs", 300)?
            .set_default("expiry.pending_timeout_secs", 1800)?
            .set_default("expiry.batch_size", 100)?
            .set_default("expiry.concurrency", 4)?
            .set_default("settlement.lock_wait_ms", 2000)?
            .set_default("settlement.fully_paid_epsilon", "0.01")?
            .set_default("dispatch.queue_capacity", 1024)?
            .set_default("dispatch.max_attempts", 3)?
            .set_default("dispatch.backoff_ms", 1000)?
            .set_default("dispatch.collaborator_timeout_secs", 10)?
            .set_default("rate_limit.requests", 30)?
            .set_default("rate_limit.per_seconds", 60)?
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
