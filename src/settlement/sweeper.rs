// Expiry Sweeper - closes payments that stayed PENDING past the timeout
//
// Each cycle:
// - Picks PENDING payments older than the pending timeout (least recently touched first, one batch)
// - Verifies each one a final time with the provider
// - Success goes through the normal reconciliation path
// - Anything else is marked FAILED with an `expired` audit entry
//
// A payment that cannot be verified is touched and retried on a later cycle, until the
// provider refuses the reference outright or it outlives the hard timeout (twice the
// pending timeout). Either way it is then expired.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use super::reconciler::{ReconcileOutcome, Reconciler, VerificationSource};
use crate::config::{ExpiryConfig, SettlementConfig};
use crate::error::AppResult;
use crate::gateway::{GatewayStatus, PaymentGateway};
use crate::ledger::models::{NewPaymentLog, Payment, PaymentLogEvent, PaymentStatus};
use crate::ledger::{LedgerStore, LockOutcome};

/// Per-cycle tally
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    /// Late successes routed through the reconciler
    pub settled: usize,
    pub expired: usize,
    /// Already closed or locked by another worker
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SweepOutcome {
    Settled,
    Expired,
    Skipped,
    Error,
}

pub struct ExpirySweeper {
    ledger: Arc<dyn LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    reconciler: Arc<Reconciler>,
    config: ExpiryConfig,
    settlement: SettlementConfig,
}

impl ExpirySweeper {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        reconciler: Arc<Reconciler>,
        config: ExpiryConfig,
        settlement: SettlementConfig,
    ) -> Self {
        Self {
            ledger,
            gateway,
            reconciler,
            config,
            settlement,
        }
    }

    /// Start the sweeper (runs in background)
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.sweep_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                "⏰ Expiry sweeper every {:?}, pending timeout {}s",
                self.config.sweep_interval(),
                self.config.pending_timeout_secs
            );

            loop {
                ticker.tick().await;

                info!("🔄 Starting expiry sweep");
                match self.sweep_once().await {
                    Ok(report) => info!("✓ Expiry sweep completed: {:?}", report),
                    Err(e) => error!("❌ Expiry sweep failed: {:?}", e),
                }
            }
        })
    }

    /// Run one sweep cycle over a single batch
    pub async fn sweep_once(&self) -> AppResult<SweepReport> {
        let cutoff = Utc::now() - self.config.pending_timeout();
        let stale = self
            .ledger
            .list_stale_pending(cutoff, self.config.batch_size)
            .await?;

        let mut report = SweepReport {
            scanned: stale.len(),
            ..SweepReport::default()
        };

        let outcomes: Vec<SweepOutcome> = stream::iter(stale)
            .map(|payment| self.close(payment))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                SweepOutcome::Settled => report.settled += 1,
                SweepOutcome::Expired => report.expired += 1,
                SweepOutcome::Skipped => report.skipped += 1,
                SweepOutcome::Error => report.errors += 1,
            }
        }

        Ok(report)
    }

    async fn close(&self, payment: Payment) -> SweepOutcome {
        match self.try_close(&payment).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    "❌ Could not close stale payment {}: {}",
                    payment.external_reference, e
                );
                SweepOutcome::Error
            }
        }
    }

    async fn try_close(&self, payment: &Payment) -> AppResult<SweepOutcome> {
        let result = match self.gateway.verify(&payment.external_reference).await {
            Ok(result) => result,
            Err(e) if e.is_permanent() => {
                warn!(
                    "⚠️ Provider refused final verification of {}, expiring: {}",
                    payment.external_reference, e
                );
                return self
                    .expire(payment, json!({ "verify_error": e.to_string() }), Value::Null)
                    .await;
            }
            Err(e) if Utc::now() - payment.created_at >= self.config.hard_timeout() => {
                warn!(
                    "⚠️ Payment {} still unverifiable past the hard timeout, expiring: {}",
                    payment.external_reference, e
                );
                return self
                    .expire(payment, json!({ "verify_error": e.to_string() }), Value::Null)
                    .await;
            }
            Err(e) => {
                warn!(
                    "⚠️ Final verification of {} failed, retrying next cycle: {}",
                    payment.external_reference, e
                );
                // Move it to the back of the queue so it cannot starve the batch
                self.ledger.touch_payment(payment.id).await?;
                return Ok(SweepOutcome::Error);
            }
        };

        if result.status == GatewayStatus::Success {
            let outcome = self
                .reconciler
                .reconcile(&result, VerificationSource::Sweeper)
                .await?;
            return Ok(match outcome {
                ReconcileOutcome::Settled(_) => SweepOutcome::Settled,
                _ => SweepOutcome::Skipped,
            });
        }

        self.expire(payment, json!({ "gateway_status": result.status }), result.raw)
            .await
    }

    /// Mark a still-PENDING payment FAILED. Offer ledger is not touched.
    async fn expire(
        &self,
        payment: &Payment,
        cause: Value,
        gateway: Value,
    ) -> AppResult<SweepOutcome> {
        let mut tx = self.ledger.begin().await?;

        let locked = match tx
            .lock_payment(payment.id, self.settlement.lock_wait())
            .await
        {
            Ok(LockOutcome::Acquired(locked)) => locked,
            Ok(LockOutcome::Missing) | Ok(LockOutcome::Contended) => {
                tx.rollback().await?;
                return Ok(SweepOutcome::Skipped);
            }
            Err(e) => {
                tx.rollback().await?;
                return Err(e);
            }
        };

        if locked.status != PaymentStatus::Pending {
            tx.rollback().await?;
            return Ok(SweepOutcome::Skipped);
        }

        let age_secs = (Utc::now() - locked.created_at).num_seconds();
        let metadata = json!({ "expired": true, "cause": cause, "age_secs": age_secs });

        let written = async {
            tx.fail_payment(locked.id, Some(metadata)).await?;
            tx.append_log(NewPaymentLog::new(
                locked.id,
                PaymentLogEvent::Expired,
                json!({ "cause": cause, "gateway": gateway, "age_secs": age_secs }),
            ))
            .await
        }
        .await;

        if let Err(e) = written {
            tx.rollback().await?;
            return Err(e);
        }
        tx.commit().await?;

        info!(
            "⏰ Payment {} expired after {}s without success",
            locked.external_reference, age_secs
        );
        Ok(SweepOutcome::Expired)
    }
}
