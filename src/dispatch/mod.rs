// Side effects of settlement: notifications, unit history, invoice ledger, tenancy
pub mod collaborators;
pub mod dispatcher;

#[cfg(test)]
pub mod recording;

pub use collaborators::{
    Collaborators, HistoryEventKind, HttpCollaborators, LogOnlyCollaborators, TenantRegistry,
};
pub use dispatcher::{SideEffect, SideEffectDispatcher};
