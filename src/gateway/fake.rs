// Scripted gateway for tests
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};

use super::{
    GatewayResult, GatewayStatus, InitializeRequest, InitializedTransaction, PaymentGateway,
};
use crate::error::GatewayError;

#[derive(Default)]
pub struct FakeGateway {
    /// Queued verify answers per reference; the last one repeats
    scripted: Mutex<HashMap<String, VecDeque<GatewayStatus>>>,
    pub initialized: Mutex<Vec<InitializeRequest>>,
    pub verify_calls: AtomicU32,
    fail_initialize: Mutex<Option<GatewayError>>,
    unreachable: Mutex<HashSet<String>>,
    unknown: Mutex<HashSet<String>>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, reference: &str, statuses: &[GatewayStatus]) {
        self.scripted
            .lock()
            .insert(reference.to_string(), statuses.iter().copied().collect());
    }

    pub fn fail_next_initialize(&self, error: GatewayError) {
        *self.fail_initialize.lock() = Some(error);
    }

    /// Verify calls for `reference` fail with a transport error
    pub fn make_unreachable(&self, reference: &str) {
        self.unreachable.lock().insert(reference.to_string());
    }

    /// Verify calls for `reference` are refused the way the provider answers an unknown reference
    pub fn forget(&self, reference: &str) {
        self.unknown.lock().insert(reference.to_string());
    }

    pub fn result(reference: &str, status: GatewayStatus, amount: Decimal) -> GatewayResult {
        GatewayResult {
            reference: reference.to_string(),
            status,
            amount: Some(amount),
            paid_at: (status == GatewayStatus::Success).then(Utc::now),
            channel: Some("card".into()),
            raw: serde_json::json!({"reference": reference}),
        }
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn initialize(
        &self,
        request: InitializeRequest,
    ) -> Result<InitializedTransaction, GatewayError> {
        if let Some(error) = self.fail_initialize.lock().take() {
            return Err(error);
        }
        let transaction = InitializedTransaction {
            access_code: format!("ac_{}", request.reference),
            access_url: format!("https://checkout.test/{}", request.reference),
        };
        self.initialized.lock().push(request);
        Ok(transaction)
    }

    async fn verify(&self, reference: &str) -> Result<GatewayResult, GatewayError> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.lock().contains(reference) {
            return Err(GatewayError::Transport("connection refused".into()));
        }
        if self.unknown.lock().contains(reference) {
            return Err(GatewayError::Rejected {
                status: 400,
                message: "Transaction reference not found".into(),
            });
        }
        let status = {
            let mut scripted = self.scripted.lock();
            match scripted.get_mut(reference) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().copied(),
                None => None,
            }
        }
        .unwrap_or(GatewayStatus::Pending);

        let mut result = FakeGateway::result(reference, status, Decimal::ZERO);
        result.amount = None;
        Ok(result)
    }
}
