mod api;
mod bootstrap;
mod config;
mod dispatch;
mod error;
mod gateway;
mod ledger;
mod middleware;
mod server;
mod settlement;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,offer_settlement=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before anything reads the environment
    dotenv::dotenv().ok();

    // Initialize tracing
    init_tracing();

    info!("🚀 Starting offer settlement service");

    // Load configuration
    let config = config::Config::from_env().context("loading configuration")?;

    let state = bootstrap::initialize_app_state(&config)
        .await
        .context("initializing application state")?;

    // Create HTTP server
    let app = server::create_app(state, &config.rate_limit).await;

    // Run the Server
    server::run_server(app, &config.bind_address)
        .await
        .context("HTTP server terminated")?;

    Ok(())
}
