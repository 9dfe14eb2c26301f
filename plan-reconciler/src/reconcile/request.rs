//! Inbound request and outbound result shapes.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    catalog::{Money, PlanTitle, Quotas},
    entitlement::{Subscription, TransactionId, UserAccount},
    error::ErrorKind,
    proration::ProrationQuote,
};

/// Requested plan transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// First paid plan, or a new plan after the previous one lapsed.
    Purchase,
    /// Another term of the current plan.
    Renew,
    /// Move to a higher-ranked plan mid-term.
    Upgrade,
}

impl Action {
    /// Returns the wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Purchase => "purchase",
            Self::Renew => "renew",
            Self::Upgrade => "upgrade",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payment confirmation forwarded by the client after checkout.
///
/// Identifiers arrive as raw strings and are validated by the reconciler so
/// that malformed input maps to `INVALID_REQUEST` rather than a parse error.
///
/// # Examples
///
/// ```
/// use plan_reconciler::reconcile::{Action, ReconcileRequest};
///
/// let json = r#"{
///     "action": "upgrade",
///     "userId": "user_1",
///     "targetPlanTitle": "Annual",
///     "orderId": "order_9",
///     "paymentId": "pay_9",
///     "signature": "ab12"
/// }"#;
/// let request: ReconcileRequest = serde_json::from_str(json).unwrap();
/// assert_eq!(request.action, Action::Upgrade);
/// assert!(request.amount_paid.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileRequest {
    /// Requested transition.
    pub action: Action,
    /// Account to change.
    pub user_id: String,
    /// Plan title after the transition.
    pub target_plan_title: String,
    /// Gateway order id.
    pub order_id: String,
    /// Gateway payment id; the idempotency key.
    pub payment_id: String,
    /// Hex HMAC over `order_id|payment_id`.
    pub signature: String,
    /// Amount the gateway reports as captured, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_paid: Option<Money>,
}

/// Subscription fields returned to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSummary {
    /// Tier after the transition.
    pub plan_title: PlanTitle,
    /// Term start.
    pub start_date: DateTime<Utc>,
    /// Term end.
    pub expiry_date: DateTime<Utc>,
    /// Amount charged.
    pub price_paid: Money,
    /// Gateway payment id.
    pub transaction_id: TransactionId,
}

impl From<&Subscription> for SubscriptionSummary {
    fn from(subscription: &Subscription) -> Self {
        Self {
            plan_title: subscription.plan_title,
            start_date: subscription.start_date,
            expiry_date: subscription.expiry_date,
            price_paid: subscription.price_paid,
            transaction_id: subscription.transaction_id.clone(),
        }
    }
}

/// Outcome returned to the client.
///
/// Failures carry only the public [`ErrorKind`], never internal detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileResult {
    /// Whether the transition was applied.
    pub success: bool,
    /// Resulting subscription, on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<SubscriptionSummary>,
    /// Failure category, on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl ReconcileResult {
    /// Successful result for a committed subscription.
    #[must_use]
    pub fn success(subscription: &Subscription) -> Self {
        Self { success: true, subscription: Some(subscription.into()), error_kind: None }
    }

    /// Failed result.
    #[must_use]
    pub const fn failure(kind: ErrorKind) -> Self {
        Self { success: false, subscription: None, error_kind: Some(kind) }
    }
}

/// Full detail of a committed transition, for in-process callers.
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    /// Transition applied.
    pub action: Action,
    /// Subscription revision written.
    pub subscription: Subscription,
    /// User state written (version as read; the store bumps it).
    pub user: UserAccount,
    /// Amount the engine computed.
    pub expected_price: Money,
    /// Proration breakdown, for upgrades.
    pub quote: Option<ProrationQuote>,
    /// Change applied to the user's counters before clamping.
    pub quota_delta: Quotas,
}

impl From<&ReconcileOutcome> for ReconcileResult {
    fn from(outcome: &ReconcileOutcome) -> Self {
        Self::success(&outcome.subscription)
    }
}
