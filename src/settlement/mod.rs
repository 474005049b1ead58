// Payment settlement: initiation, verification entry points, reconciliation,
// allocation and expiry
pub mod allocation;
pub mod initiator;
pub mod offers;
pub mod polling;
pub mod reconciler;
pub mod refunds;
pub mod sweeper;


pub use initiator::{InitiatePayment, InitiatedPayment, PaymentInitiator};
pub use offers::OfferService;
pub use polling::{PollingWorker, VerificationScheduler};
pub use reconciler::{ReconcileOutcome, Reconciler, VerificationSource};
pub use refunds::RefundDesk;
pub use sweeper::ExpirySweeper;
