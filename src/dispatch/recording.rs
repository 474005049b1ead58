// Collaborator double that records successful calls
use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use uuid::Uuid;

use super::collaborators::{Collaborators, HistoryEventKind, TenantRegistry};
use crate::error::{AppError, AppResult};
use crate::ledger::models::Offer;

#[derive(Default)]
pub struct RecordingCollaborators {
    calls: Mutex<Vec<(String, String)>>,
    failures_left: AtomicU32,
    reject_attach: AtomicBool,
}

impl RecordingCollaborators {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` collaborator calls
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn reject_attach(&self) {
        self.reject_attach.store(true, Ordering::SeqCst);
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.lock().iter().filter(|(name, _)| name == call).count()
    }

    pub fn details(&self, call: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|(name, _)| name == call)
            .map(|(_, detail)| detail.clone())
            .collect()
    }

    fn record(&self, call: &str, detail: String) -> AppResult<()> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AppError::Collaborator(format!("{} unavailable", call)));
        }
        self.calls.lock().push((call.to_string(), detail));
        Ok(())
    }
}

#[async_trait]
impl Collaborators for RecordingCollaborators {
    async fn notify_winner(&self, offer: &Offer) -> AppResult<()> {
        self.record("notify_winner", offer.id.to_string())
    }

    async fn notify_losers(&self, offers: &[Offer]) -> AppResult<()> {
        let ids: Vec<String> = offers.iter().map(|o| o.id.to_string()).collect();
        self.record("notify_losers", ids.join(","))
    }

    async fn notify_landlord(&self, offer: &Offer, outstanding: Decimal) -> AppResult<()> {
        self.record("notify_landlord", format!("{}:{}", offer.id, outstanding))
    }

    async fn notify_refund_owed(&self, offer: &Offer, amount: Decimal) -> AppResult<()> {
        self.record("notify_refund_owed", format!("{}:{}", offer.id, amount))
    }

    async fn record_history_event(
        &self,
        unit_id: Uuid,
        kind: HistoryEventKind,
        description: &str,
    ) -> AppResult<()> {
        self.record(
            "record_history_event",
            format!("{}:{:?}:{}", unit_id, kind, description),
        )
    }

    async fn record_invoice_payment(
        &self,
        offer_id: Uuid,
        amount: Decimal,
        reference: &str,
    ) -> AppResult<()> {
        self.record(
            "record_invoice_payment",
            format!("{}:{}:{}", offer_id, amount, reference),
        )
    }
}

#[async_trait]
impl TenantRegistry for RecordingCollaborators {
    async fn attach_tenant(&self, offer: &Offer) -> AppResult<()> {
        if self.reject_attach.load(Ordering::SeqCst) {
            return Err(AppError::Collaborator("tenancy service refused".into()));
        }
        self.record("attach_tenant", offer.id.to_string())
    }
}
