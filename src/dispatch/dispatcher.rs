use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::collaborators::{Collaborators, HistoryEventKind};
use crate::config::DispatchConfig;
use crate::error::AppResult;
use crate::ledger::models::Offer;

/// A collaborator call queued after a settlement commit
#[derive(Debug, Clone)]
pub enum SideEffect {
    NotifyWinner(Offer),
    NotifyLosers(Vec<Offer>),
    NotifyLandlord { offer: Offer, outstanding: Decimal },
    NotifyRefundOwed { offer: Offer, amount: Decimal },
    RecordHistory {
        unit_id: Uuid,
        kind: HistoryEventKind,
        description: String,
    },
    RecordInvoicePayment {
        offer_id: Uuid,
        amount: Decimal,
        reference: String,
    },
}

impl SideEffect {
    fn name(&self) -> &'static str {
        match self {
            SideEffect::NotifyWinner(_) => "notify_winner",
            SideEffect::NotifyLosers(_) => "notify_losers",
            SideEffect::NotifyLandlord { .. } => "notify_landlord",
            SideEffect::NotifyRefundOwed { .. } => "notify_refund_owed",
            SideEffect::RecordHistory { .. } => "record_history_event",
            SideEffect::RecordInvoicePayment { .. } => "record_invoice_payment",
        }
    }

    async fn deliver(&self, collaborators: &dyn Collaborators) -> AppResult<()> {
        match self {
            SideEffect::NotifyWinner(offer) => collaborators.notify_winner(offer).await,
            SideEffect::NotifyLosers(offers) => collaborators.notify_losers(offers).await,
            SideEffect::NotifyLandlord { offer, outstanding } => {
                collaborators.notify_landlord(offer, *outstanding).await
            }
            SideEffect::NotifyRefundOwed { offer, amount } => {
                collaborators.notify_refund_owed(offer, *amount).await
            }
            SideEffect::RecordHistory {
                unit_id,
                kind,
                description,
            } => {
                collaborators
                    .record_history_event(*unit_id, *kind, description)
                    .await
            }
            SideEffect::RecordInvoicePayment {
                offer_id,
                amount,
                reference,
            } => {
                collaborators
                    .record_invoice_payment(*offer_id, *amount, reference)
                    .await
            }
        }
    }
}

/// Retry policy for a single side effect
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl From<&DispatchConfig> for RetryPolicy {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_millis(config.backoff_ms),
        }
    }
}

/// Producer half of the side-effect queue. Never blocks the caller.
#[derive(Clone)]
pub struct SideEffectDispatcher {
    sender: mpsc::Sender<SideEffect>,
}

impl SideEffectDispatcher {
    /// Queue without a worker; the receiver is handed to the caller
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SideEffect>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Queue plus a background worker delivering to `collaborators`
    pub fn spawn(
        collaborators: Arc<dyn Collaborators>,
        config: &DispatchConfig,
    ) -> (Self, JoinHandle<()>) {
        let (dispatcher, receiver) = Self::channel(config.queue_capacity);
        let policy = RetryPolicy::from(config);
        let handle = tokio::spawn(run_worker(receiver, collaborators, policy));
        (dispatcher, handle)
    }

    pub fn dispatch(&self, effect: SideEffect) {
        match self.sender.try_send(effect) {
            Ok(()) => {}
            Err(TrySendError::Full(effect)) => {
                error!("❌ Side-effect queue full, dropping {}", effect.name());
            }
            Err(TrySendError::Closed(effect)) => {
                error!("❌ Side-effect queue closed, dropping {}", effect.name());
            }
        }
    }

    pub fn dispatch_all(&self, effects: impl IntoIterator<Item = SideEffect>) {
        for effect in effects {
            self.dispatch(effect);
        }
    }
}

async fn run_worker(
    mut receiver: mpsc::Receiver<SideEffect>,
    collaborators: Arc<dyn Collaborators>,
    policy: RetryPolicy,
) {
    info!("✓ Side-effect dispatcher started");
    while let Some(effect) = receiver.recv().await {
        deliver_with_retry(&effect, collaborators.as_ref(), policy).await;
    }
    info!("Side-effect dispatcher stopped");
}

/// Deliver one effect; returns whether it eventually succeeded.
/// Failures are logged and never propagated.
pub async fn deliver_with_retry(
    effect: &SideEffect,
    collaborators: &dyn Collaborators,
    policy: RetryPolicy,
) -> bool {
    for attempt in 1..=policy.max_attempts {
        match effect.deliver(collaborators).await {
            Ok(()) => return true,
            Err(e) if attempt < policy.max_attempts => {
                warn!(
                    "⚠️ {} failed (attempt {}/{}): {}",
                    effect.name(),
                    attempt,
                    policy.max_attempts,
                    e
                );
                tokio::time::sleep(policy.backoff * attempt).await;
            }
            Err(e) => {
                error!(
                    "❌ {} failed permanently after {} attempts: {}",
                    effect.name(),
                    attempt,
                    e
                );
            }
        }
    }
    false
}
