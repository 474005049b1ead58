use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use http::{HeaderName, HeaderValue};
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
use tracing::info;

use crate::{
    api::{
        handler::{
            accept_offer, gateway_webhook, get_offer, get_payment, health_check, initiate_payment,
            list_refunds, mark_refunded, reject_offer, verify_payment, AppState,
        },
        models::InitiatePaymentRequest,
    },
    config::RateLimitConfig,
    middleware::{rate_limit_middleware, validate_json, RateLimitLayer},
};

pub async fn create_app(state: AppState, rate_limit: &RateLimitConfig) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let limiter = RateLimitLayer::from(rate_limit);

    // Initiation calls out to the provider, so it is validated and throttled up front
    let payments = Router::new()
        .route("/offers/:token/payments", post(initiate_payment))
        .route_layer(middleware::from_fn(validate_json::<InitiatePaymentRequest>))
        .route_layer(middleware::from_fn_with_state(limiter, rate_limit_middleware));

    let app = Router::new()
        // Public health check endpoint
        .route("/health", get(health_check))
        .nest(
            "/api/v1",
            Router::new()
                .merge(payments)
                // Offer endpoints
                .route("/offers/:token", get(get_offer))
                .route("/offers/:token/accept", post(accept_offer))
                .route("/offers/:token/reject", post(reject_offer))
                // Gateway push notifications
                .route("/webhooks/gateway", post(gateway_webhook))
                // Payment lookup and on-demand verification
                .route("/payments/:reference", get(get_payment))
                .route("/payments/:reference/verify", post(verify_payment))
                // Admin endpoints
                .route("/admin/refunds", get(list_refunds))
                .route("/admin/payments/:id/refund", post(mark_refunded)),
        )
        .layer(CompressionLayer::new())
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(CorsLayer::very_permissive())
        // Add request tracing
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(app: Router, bind_address: &str) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app).await?;
    Ok(())
}
