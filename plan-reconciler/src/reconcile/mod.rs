//! Subscription reconciliation.
//!
//! [`SubscriptionReconciler`] turns a signed payment confirmation into a
//! committed plan transition. [`PlanState`] decides which transitions a user
//! may take; the request and result types are the wire contract.

mod locks;
mod reconciler;
mod request;
mod state;

pub use reconciler::{ReconcilerSettings, SubscriptionReconciler};
pub use request::{
    Action, ReconcileOutcome, ReconcileRequest, ReconcileResult, SubscriptionSummary,
};
pub use state::{PlanState, PlanStatus, UpgradePreview};
