use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use governor::{clock::DefaultClock, state::InMemoryState, state::NotKeyed, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::RateLimitConfig;
use crate::error::ErrorResponse;

/// Process-wide limiter shared by the routes it guards
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl RateLimitLayer {
    /// `requests` per `per_seconds`, refilled evenly across the window
    pub fn new(requests: u32, per_seconds: u64) -> Self {
        let burst = NonZeroU32::new(requests).unwrap_or(NonZeroU32::MIN);
        let window = Duration::from_secs(per_seconds.max(1));
        let quota = Quota::with_period(window / burst.get())
            .unwrap_or_else(|| Quota::per_second(burst))
            .allow_burst(burst);

        RateLimitLayer {
            limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    pub fn check(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

impl From<&RateLimitConfig> for RateLimitLayer {
    fn from(config: &RateLimitConfig) -> Self {
        Self::new(config.requests, config.per_seconds)
    }
}

pub async fn rate_limit_middleware(
    State(limiter): State<RateLimitLayer>,
    req: Request,
    next: Next,
) -> Response {
    if !limiter.check() {
        warn!("⚠️ Rate limit exceeded for {}", req.uri().path());
        let body = ErrorResponse {
            error: "Rate limit exceeded. Please try again later.".to_string(),
            error_code: "RATE_LIMITED".to_string(),
            details: None,
        };
        return (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    }
    next.run(req).await
}
