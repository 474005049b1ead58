// Winner selection for a unit
use chrono::Utc;
use tracing::{info, warn};

use crate::dispatch::{Collaborators, HistoryEventKind, TenantRegistry};
use crate::error::AppResult;
use crate::ledger::models::{Offer, OfferStatus, Unit, UnitStatus};
use crate::ledger::LedgerTx;

/// Outcome of a successful allocation
#[derive(Debug, Clone)]
pub struct Allocation {
    pub winner: Offer,
    pub losers: Vec<Offer>,
}

/// Give `unit` to `offer` inside the caller's transaction.
///
/// The unit row must already be locked and not OCCUPIED. Any error leaves the
/// transaction to be rolled back by the caller, tenant attachment included.
pub async fn allocate(
    tx: &mut dyn LedgerTx,
    unit: &Unit,
    offer: &Offer,
    tenants: &dyn TenantRegistry,
    collaborators: &dyn Collaborators,
) -> AppResult<Allocation> {
    tx.set_unit_status(unit, UnitStatus::Occupied).await?;

    let selected_at = Utc::now();
    tx.set_offer_status(offer.id, OfferStatus::Selected, Some(selected_at))
        .await?;

    let mut winner = offer.clone();
    winner.status = OfferStatus::Selected;
    winner.selected_at = Some(selected_at);

    tenants.attach_tenant(&winner).await?;

    let mut losers = Vec::new();
    for other in tx.list_unit_offers(unit.id).await? {
        if other.id == winner.id
            || other.amount_paid <= rust_decimal::Decimal::ZERO
            || other.status.is_terminal()
        {
            continue;
        }
        tx.set_offer_status(other.id, OfferStatus::RejectedByPayment, None)
            .await?;
        let mut loser = other;
        loser.status = OfferStatus::RejectedByPayment;
        losers.push(loser);
    }

    info!(
        "🏆 Unit {} allocated to offer {} ({} competing offers rejected)",
        unit.id,
        winner.id,
        losers.len()
    );

    // Activity feed, best effort
    if let Err(e) = collaborators
        .record_history_event(
            unit.id,
            HistoryEventKind::TenantAttached,
            &format!("Applicant {} secured the unit with offer {}", winner.applicant_id, winner.id),
        )
        .await
    {
        warn!("⚠️ History event for unit {} not recorded: {}", unit.id, e);
    }
    for loser in &losers {
        if let Err(e) = collaborators
            .record_history_event(
                unit.id,
                HistoryEventKind::OfferRejectedByPayment,
                &format!(
                    "Offer {} rejected by payment, {} to be refunded",
                    loser.id, loser.amount_paid
                ),
            )
            .await
        {
            warn!("⚠️ History event for offer {} not recorded: {}", loser.id, e);
        }
    }

    Ok(Allocation { winner, losers })
}
