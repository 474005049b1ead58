// Polling worker: re-verifies freshly initiated payments on a fixed schedule
// until the provider gives a final answer or the attempt budget runs out.
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::reconciler::{ReconcileOutcome, Reconciler, VerificationSource};
use crate::config::VerificationConfig;
use crate::error::{AppError, AppResult, PaymentError};
use crate::gateway::PaymentGateway;
use crate::ledger::models::{Payment, PaymentStatus};
use crate::ledger::LedgerStore;

#[derive(Debug, Clone)]
pub struct VerificationJob {
    pub reference: String,
}

/// Producer side of the verification queue
#[derive(Clone)]
pub struct VerificationScheduler {
    sender: mpsc::Sender<VerificationJob>,
}

impl VerificationScheduler {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<VerificationJob>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Queue a verification job. Returns false when the job was dropped.
    pub fn schedule(&self, reference: &str) -> bool {
        let job = VerificationJob {
            reference: reference.to_string(),
        };
        match self.sender.try_send(job) {
            Ok(()) => {
                debug!("Verification scheduled for {}", reference);
                true
            }
            Err(TrySendError::Full(job)) => {
                error!("❌ Verification queue full, dropping {}", job.reference);
                false
            }
            Err(TrySendError::Closed(job)) => {
                error!("❌ Verification queue closed, dropping {}", job.reference);
                false
            }
        }
    }
}

/// Result of one polling attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStep {
    /// Nothing left to do for this reference
    Done,
    /// Check again after the interval
    Retry,
}

pub struct PollingWorker {
    ledger: Arc<dyn LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    reconciler: Arc<Reconciler>,
    config: VerificationConfig,
}

impl PollingWorker {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        reconciler: Arc<Reconciler>,
        config: VerificationConfig,
    ) -> Self {
        Self {
            ledger,
            gateway,
            reconciler,
            config,
        }
    }

    /// Consume jobs; each reference is followed on its own task
    pub fn start(self: Arc<Self>, mut receiver: mpsc::Receiver<VerificationJob>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "✓ Polling worker started (first check after {:?}, then every {:?}, {} attempts)",
                self.config.initial_delay(),
                self.config.interval(),
                self.config.max_attempts
            );
            while let Some(job) = receiver.recv().await {
                let worker = self.clone();
                tokio::spawn(async move { worker.follow(job.reference).await });
            }
        })
    }

    async fn follow(&self, reference: String) {
        tokio::time::sleep(self.config.initial_delay()).await;

        for attempt in 1..=self.config.max_attempts {
            debug!(
                "Polling {} (attempt {}/{})",
                reference, attempt, self.config.max_attempts
            );
            if self.poll_once(&reference).await == PollStep::Done {
                return;
            }
            if attempt < self.config.max_attempts {
                tokio::time::sleep(self.config.interval()).await;
            }
        }

        info!(
            "⏰ Payment {} unresolved after {} polls, leaving it to the expiry sweeper",
            reference, self.config.max_attempts
        );
    }

    /// One verification round trip for `reference`
    pub async fn poll_once(&self, reference: &str) -> PollStep {
        match self.ledger.get_payment_by_reference(reference).await {
            Ok(Some(payment)) if payment.status != PaymentStatus::Pending => {
                debug!("Payment {} already {}, polling stops", reference, payment.status.as_str());
                return PollStep::Done;
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                error!("❌ Polling unknown payment reference {}", reference);
                return PollStep::Done;
            }
            Err(e) => {
                warn!("⚠️ Could not read payment {}: {}", reference, e);
                return PollStep::Retry;
            }
        }

        let result = match self.gateway.verify(reference).await {
            Ok(result) => result,
            Err(e) => {
                warn!("⚠️ Gateway verify failed for {}: {}", reference, e);
                return PollStep::Retry;
            }
        };

        match self.reconciler.reconcile(&result, VerificationSource::Polling).await {
            Ok(outcome) if outcome.needs_retry() => PollStep::Retry,
            Ok(_) => PollStep::Done,
            Err(AppError::Payment(PaymentError::PaymentNotFound(_))) => PollStep::Done,
            Err(e) if e.is_transient() => {
                warn!("⚠️ Reconciliation of {} failed, will retry: {}", reference, e);
                PollStep::Retry
            }
            Err(e) => {
                error!("❌ Reconciliation of {} failed permanently: {}", reference, e);
                PollStep::Done
            }
        }
    }

    /// Verify right now on behalf of the payer's callback page
    pub async fn verify_now(&self, reference: &str) -> AppResult<(Payment, ReconcileOutcome)> {
        let payment = self
            .ledger
            .get_payment_by_reference(reference)
            .await?
            .ok_or_else(|| PaymentError::PaymentNotFound(reference.to_string()))?;

        if payment.status != PaymentStatus::Pending {
            let outcome = match payment.status {
                PaymentStatus::Completed => ReconcileOutcome::AlreadyCompleted,
                status => ReconcileOutcome::AlreadyTerminal(status),
            };
            return Ok((payment, outcome));
        }

        let result = self.gateway.verify(reference).await?;
        let outcome = self
            .reconciler
            .reconcile(&result, VerificationSource::Callback)
            .await?;

        let payment = self
            .ledger
            .get_payment_by_reference(reference)
            .await?
            .ok_or_else(|| PaymentError::PaymentNotFound(reference.to_string()))?;
        Ok((payment, outcome))
    }
}
