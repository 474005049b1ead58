// Collaborator clients
//
// Notification delivery, unit activity history, invoicing and tenancy live in
// other services. Settlement only talks to them through these traits.

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Serialize;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::ledger::models::Offer;

/// Activity feed entry kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryEventKind {
    TenantAttached,
    OfferRejectedByPayment,
    PaymentHeldRaceCondition,
}

/// One-way, best-effort calls made after (or alongside) a settlement decision
#[async_trait]
pub trait Collaborators: Send + Sync {
    /// Winner is told the unit is secured
    async fn notify_winner(&self, offer: &Offer) -> AppResult<()>;

    /// Losing applicants are told a refund is owed
    async fn notify_losers(&self, offers: &[Offer]) -> AppResult<()>;

    /// Landlord is told about a payment and what is still outstanding
    async fn notify_landlord(&self, offer: &Offer, outstanding: Decimal) -> AppResult<()>;

    /// Payer and landlord are told `amount` must be handed back
    async fn notify_refund_owed(&self, offer: &Offer, amount: Decimal) -> AppResult<()>;

    async fn record_history_event(
        &self,
        unit_id: Uuid,
        kind: HistoryEventKind,
        description: &str,
    ) -> AppResult<()>;

    async fn record_invoice_payment(
        &self,
        offer_id: Uuid,
        amount: Decimal,
        reference: &str,
    ) -> AppResult<()>;
}

/// Tenant of record for a unit. Called inside the allocation transaction,
/// so a failure here rolls the allocation back.
#[async_trait]
pub trait TenantRegistry: Send + Sync {
    async fn attach_tenant(&self, offer: &Offer) -> AppResult<()>;
}

/// Collaborators reached over HTTP
pub struct HttpCollaborators {
    base_url: String,
    client: Client,
}

#[derive(Debug, Serialize)]
struct LandlordPaymentNotice<'a> {
    offer: &'a Offer,
    outstanding_balance: Decimal,
}

#[derive(Debug, Serialize)]
struct RefundNotice<'a> {
    offer: &'a Offer,
    amount: Decimal,
}

#[derive(Debug, Serialize)]
struct HistoryEvent<'a> {
    kind: HistoryEventKind,
    description: &'a str,
}

#[derive(Debug, Serialize)]
struct InvoicePayment<'a> {
    offer_id: Uuid,
    amount: Decimal,
    reference: &'a str,
}

#[derive(Debug, Serialize)]
struct TenantAttachment {
    offer_id: Uuid,
    applicant_id: Uuid,
}

impl HttpCollaborators {
    pub fn new(base_url: &str, timeout: Duration) -> AppResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> AppResult<()> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::Collaborator(format!(
                "{} returned {}: {}",
                path, status, error_text
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl Collaborators for HttpCollaborators {
    async fn notify_winner(&self, offer: &Offer) -> AppResult<()> {
        self.post("/notifications/offer-secured", offer).await?;
        info!("📧 Winner notified for offer {}", offer.id);
        Ok(())
    }

    async fn notify_losers(&self, offers: &[Offer]) -> AppResult<()> {
        self.post("/notifications/offer-lost", offers).await?;
        info!("📧 {} losing applicants notified", offers.len());
        Ok(())
    }

    async fn notify_landlord(&self, offer: &Offer, outstanding: Decimal) -> AppResult<()> {
        self.post(
            "/notifications/landlord-payment",
            &LandlordPaymentNotice {
                offer,
                outstanding_balance: outstanding,
            },
        )
        .await
    }

    async fn notify_refund_owed(&self, offer: &Offer, amount: Decimal) -> AppResult<()> {
        self.post("/notifications/refund-owed", &RefundNotice { offer, amount })
            .await
    }

    async fn record_history_event(
        &self,
        unit_id: Uuid,
        kind: HistoryEventKind,
        description: &str,
    ) -> AppResult<()> {
        self.post(
            &format!("/units/{}/history", unit_id),
            &HistoryEvent { kind, description },
        )
        .await
    }

    async fn record_invoice_payment(
        &self,
        offer_id: Uuid,
        amount: Decimal,
        reference: &str,
    ) -> AppResult<()> {
        self.post(
            "/invoices/payments",
            &InvoicePayment {
                offer_id,
                amount,
                reference,
            },
        )
        .await
    }
}

#[async_trait]
impl TenantRegistry for HttpCollaborators {
    async fn attach_tenant(&self, offer: &Offer) -> AppResult<()> {
        self.post(
            &format!("/units/{}/tenant", offer.unit_id),
            &TenantAttachment {
                offer_id: offer.id,
                applicant_id: offer.applicant_id,
            },
        )
        .await?;
        info!("🏠 Applicant {} attached to unit {}", offer.applicant_id, offer.unit_id);
        Ok(())
    }
}

/// Used when no collaborator service is configured
pub struct LogOnlyCollaborators;

#[async_trait]
impl Collaborators for LogOnlyCollaborators {
    async fn notify_winner(&self, offer: &Offer) -> AppResult<()> {
        info!("🔔 [notify] offer {} secured unit {}", offer.id, offer.unit_id);
        Ok(())
    }

    async fn notify_losers(&self, offers: &[Offer]) -> AppResult<()> {
        for offer in offers {
            info!("🔔 [notify] offer {} lost unit {}, refund owed", offer.id, offer.unit_id);
        }
        Ok(())
    }

    async fn notify_landlord(&self, offer: &Offer, outstanding: Decimal) -> AppResult<()> {
        info!(
            "🔔 [notify] landlord {}: offer {} paid {}, outstanding {}",
            offer.landlord_id, offer.id, offer.amount_paid, outstanding
        );
        Ok(())
    }

    async fn notify_refund_owed(&self, offer: &Offer, amount: Decimal) -> AppResult<()> {
        info!("🔔 [notify] refund of {} owed on offer {}", amount, offer.id);
        Ok(())
    }

    async fn record_history_event(
        &self,
        unit_id: Uuid,
        kind: HistoryEventKind,
        description: &str,
    ) -> AppResult<()> {
        info!("[history] unit {} {:?}: {}", unit_id, kind, description);
        Ok(())
    }

    async fn record_invoice_payment(
        &self,
        offer_id: Uuid,
        amount: Decimal,
        reference: &str,
    ) -> AppResult<()> {
        info!("[invoice] offer {} paid {} ({})", offer_id, amount, reference);
        Ok(())
    }
}

#[async_trait]
impl TenantRegistry for LogOnlyCollaborators {
    async fn attach_tenant(&self, offer: &Offer) -> AppResult<()> {
        info!("[tenancy] applicant {} attached to unit {}", offer.applicant_id, offer.unit_id);
        Ok(())
    }
}
