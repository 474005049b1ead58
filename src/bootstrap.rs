use sqlx::{postgres::PgPoolOptions, PgPool};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

use crate::{
    api::{handler::AppState, webhook::WebhookProcessor},
    config::Config,
    dispatch::{
        dispatcher::RetryPolicy, Collaborators, HttpCollaborators, LogOnlyCollaborators,
        SideEffectDispatcher, TenantRegistry,
    },
    error::{AppError, AppResult},
    gateway::{client::PaystackClient, PaymentGateway},
    ledger::{LedgerRepository, LedgerStore},
    settlement::{
        ExpirySweeper, OfferService, PaymentInitiator, PollingWorker, Reconciler, RefundDesk,
        VerificationScheduler,
    },
};

pub async fn initialize_app_state(config: &Config) -> AppResult<AppState> {
    info!("Initializing application components ...");

    // Webhook signatures cannot be checked without a secret
    let webhook_secret = config.gateway.webhook_secret().ok_or_else(|| {
        AppError::Config(
            "webhook signing secret is empty (set GATEWAY__WEBHOOK_SECRET or GATEWAY__SECRET_KEY)"
                .to_string(),
        )
    })?;

    // Database pool
    let pool = initialize_database(&config.database_url).await?;

    // Core components
    let ledger: Arc<dyn LedgerStore> = Arc::new(LedgerRepository::new(pool));

    let gateway: Arc<dyn PaymentGateway> = Arc::new(PaystackClient::new(&config.gateway)?);
    info!("✅ Payment gateway client ready for {}", config.gateway.base_url);
    if config.gateway.secret_key.is_empty() {
        warn!("⚠️  GATEWAY__SECRET_KEY not set - provider calls will be rejected");
    }

    // Notification, history and tenancy collaborators
    let (collaborators, tenants): (Arc<dyn Collaborators>, Arc<dyn TenantRegistry>) =
        match &config.dispatch.collaborator_url {
            Some(url) => {
                let http = Arc::new(HttpCollaborators::new(
                    url,
                    Duration::from_secs(config.dispatch.collaborator_timeout_secs),
                )?);
                info!("✅ Collaborator service configured at {}", url);
                let collaborators: Arc<dyn Collaborators> = http.clone();
                let tenants: Arc<dyn TenantRegistry> = http;
                (collaborators, tenants)
            }
            None => {
                warn!("⚠️  DISPATCH__COLLABORATOR_URL not set - side effects are only logged");
                let log_only = Arc::new(LogOnlyCollaborators);
                let collaborators: Arc<dyn Collaborators> = log_only.clone();
                let tenants: Arc<dyn TenantRegistry> = log_only;
                (collaborators, tenants)
            }
        };

    let (dispatcher, _dispatch_worker) =
        SideEffectDispatcher::spawn(collaborators.clone(), &config.dispatch);
    info!("✅ Side-effect dispatcher started");

    let reconciler = Arc::new(Reconciler::new(
        ledger.clone(),
        tenants,
        collaborators,
        dispatcher,
        config.settlement.clone(),
    ));

    // Background verification
    let (scheduler, jobs) = VerificationScheduler::channel(config.verification.queue_capacity);
    let poller = Arc::new(PollingWorker::new(
        ledger.clone(),
        gateway.clone(),
        reconciler.clone(),
        config.verification.clone(),
    ));
    let _poll_worker = poller.clone().start(jobs);

    let sweeper = Arc::new(ExpirySweeper::new(
        ledger.clone(),
        gateway.clone(),
        reconciler.clone(),
        config.expiry.clone(),
        config.settlement.clone(),
    ));
    let _sweep_worker = sweeper.start();
    info!("✅ Expiry sweeper started");

    let lock_wait = config.settlement.lock_wait();
    let webhooks = Arc::new(WebhookProcessor::new(
        reconciler,
        scheduler.clone(),
        RetryPolicy::from(&config.dispatch),
    ));

    let state = AppState {
        ledger: ledger.clone(),
        initiator: Arc::new(PaymentInitiator::new(ledger.clone(), gateway, scheduler)),
        offers: Arc::new(OfferService::new(ledger.clone(), lock_wait)),
        poller,
        refunds: Arc::new(RefundDesk::new(ledger, lock_wait)),
        webhooks,
        webhook_secret: Arc::from(webhook_secret),
    };

    info!("✅ Application state initialized");
    Ok(state)
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(50)
        .min_connections(5)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("✓ Database pool configured: 50 max connections");

    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
