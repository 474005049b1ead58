use axum::{
    body::Body,
    extract::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::de::DeserializeOwned;
use validator::{Validate, ValidationErrors};

use crate::error::AppError;

/// Request bodies above this are rejected before parsing
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// Parse and validate a JSON body as `T` before the handler runs.
/// The handler still receives the original bytes.
pub async fn validate_json<T: DeserializeOwned + Validate>(
    req: Request,
    next: Next,
) -> Result<impl IntoResponse, AppError> {
    let (parts, body) = req.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|_| AppError::InvalidInput("Invalid or oversized request body".to_string()))?;

    let value: T = serde_json::from_slice(&bytes)
        .map_err(|e| AppError::InvalidInput(format!("Invalid JSON: {}", e)))?;

    value
        .validate()
        .map_err(|e| AppError::InvalidInput(format!("Validation failed: {}", describe(&e))))?;

    let req = Request::from_parts(parts, Body::from(bytes));
    Ok::<Response, AppError>(next.run(req).await)
}

fn describe(errors: &ValidationErrors) -> String {
    let mut fields: Vec<String> = errors
        .field_errors()
        .into_iter()
        .map(|(field, errors)| {
            let messages: Vec<String> = errors
                .iter()
                .map(|e| {
                    e.message
                        .as_ref()
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| e.code.to_string())
                })
                .collect();
            format!("{}: {}", field, messages.join(", "))
        })
        .collect();
    fields.sort();
    fields.join("; ")
}
