use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Payment error: {0}")]
    Payment(#[from] PaymentError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid state: {current}, expected: {expected}")]
    InvalidState { current: String, expected: String },

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Collaborator error: {0}")]
    Collaborator(String),

    #[error("Resource busy: {0}")]
    Busy(String),
}

/// Payment initiation and settlement errors
#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("Amount {amount} is invalid, outstanding balance is {outstanding}")]
    AmountInvalid { amount: Decimal, outstanding: Decimal },

    #[error("Unit {0} is no longer available")]
    UnitUnavailable(uuid::Uuid),

    #[error("Offer not found: {0}")]
    OfferNotFound(String),

    #[error("Payment not found for reference: {0}")]
    PaymentNotFound(String),

    #[error("Could not allocate a unique payment reference after {0} attempts")]
    ReferenceExhausted(u32),

    #[error("Payment {0} is not eligible for refund")]
    NotRefundable(uuid::Uuid),
}

/// Payment gateway errors
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Gateway request failed: {0}")]
    Transport(String),

    #[error("Gateway rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Gateway returned an unreadable response: {0}")]
    Malformed(String),

    #[error("Gateway unavailable after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

impl GatewayError {
    /// Transport failures and provider 5xx are worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Transport(_) => true,
            GatewayError::Rejected { status, .. } => *status >= 500 || *status == 429,
            GatewayError::Malformed(_) | GatewayError::Exhausted { .. } => false,
        }
    }

    /// The provider answered and refused; asking again will not change the answer
    pub fn is_permanent(&self) -> bool {
        matches!(self, GatewayError::Rejected { .. }) && !self.is_retryable()
    }
}

impl AppError {
    /// Errors a background worker should retry rather than give up on
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Database(_) | AppError::Busy(_) | AppError::Collaborator(_) => true,
            AppError::Gateway(e) => e.is_retryable() || matches!(e, GatewayError::Exhausted { .. }),
            _ => false,
        }
    }
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match self {
            AppError::Payment(PaymentError::AmountInvalid { amount, outstanding }) => (
                StatusCode::BAD_REQUEST,
                "AMOUNT_INVALID",
                format!("Amount {} is invalid for this offer", amount),
                Some(serde_json::json!({
                    "amount": amount.to_string(),
                    "outstanding_balance": outstanding.to_string(),
                })),
            ),
            AppError::Payment(PaymentError::UnitUnavailable(unit_id)) => (
                StatusCode::CONFLICT,
                "UNIT_UNAVAILABLE",
                "This unit has already been secured by another applicant".to_string(),
                Some(serde_json::json!({"unit_id": unit_id})),
            ),
            AppError::Payment(PaymentError::OfferNotFound(token)) => (
                StatusCode::NOT_FOUND,
                "OFFER_NOT_FOUND",
                format!("Offer not found: {}", token),
                None,
            ),
            AppError::Payment(PaymentError::PaymentNotFound(reference)) => (
                StatusCode::NOT_FOUND,
                "PAYMENT_NOT_FOUND",
                format!("Payment not found: {}", reference),
                None,
            ),
            AppError::Payment(PaymentError::ReferenceExhausted(attempts)) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "REFERENCE_EXHAUSTED",
                "Could not allocate a payment reference, please retry".to_string(),
                Some(serde_json::json!({"attempts": attempts})),
            ),
            AppError::Payment(PaymentError::NotRefundable(payment_id)) => (
                StatusCode::CONFLICT,
                "NOT_REFUNDABLE",
                format!("Payment {} is not owed a refund", payment_id),
                None,
            ),
            AppError::Gateway(e) => (
                StatusCode::BAD_GATEWAY,
                "GATEWAY_ERROR",
                format!("Payment provider error: {}", e),
                None,
            ),
            AppError::InvalidState { current, expected } => (
                StatusCode::CONFLICT,
                "INVALID_STATE",
                format!("Invalid state: {}", current),
                Some(serde_json::json!({"expected": expected})),
            ),
            AppError::InvalidInput(message) => (
                StatusCode::BAD_REQUEST,
                "INVALID_INPUT",
                message,
                None,
            ),
            AppError::NotFound(message) => (StatusCode::NOT_FOUND, "NOT_FOUND", message, None),
            AppError::Busy(message) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "RESOURCE_BUSY",
                message,
                None,
            ),
            AppError::InvalidSignature => (
                StatusCode::UNAUTHORIZED,
                "INVALID_SIGNATURE",
                "Signature verification failed".to_string(),
                None,
            ),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
                None,
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
                None,
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(format!("Error converting: {:?}", error))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        AppError::Collaborator(format!("HTTP request error: {:?}", error))
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
