//! Per-user plan state and the transitions it permits.
//!
//! ```text
//!            purchase
//!   Free ───────────────► ActiveTerm ──(window)──► ExpiringSoon
//!                            ▲   │                     │   │
//!                  upgrade   └───┘      renew          │   │ expiry
//!                                 ◄────────────────────┘   ▼
//!                            ◄──────── purchase ────── Lapsed
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    catalog::{PlanTier, PlanTitle, Quotas},
    entitlement::{Subscription, UserAccount},
    proration::ProrationQuote,
};

/// Where a user stands relative to their paid term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanState {
    /// No subscription record.
    Free,
    /// Inside a paid term, outside the renewal window.
    ActiveTerm,
    /// Inside a paid term and within the renewal window of expiry.
    ExpiringSoon,
    /// Past expiry; the account still shows the paid tier.
    Lapsed,
}

impl PlanState {
    /// Classifies a user's current subscription at `now`.
    ///
    /// With `renewal_window_days = None` a running term is always
    /// [`ActiveTerm`](Self::ActiveTerm).
    ///
    /// # Examples
    ///
    /// ```
    /// use chrono::Utc;
    /// use plan_reconciler::reconcile::PlanState;
    ///
    /// assert_eq!(PlanState::classify(None, Utc::now(), Some(3)), PlanState::Free);
    /// ```
    #[must_use]
    pub fn classify(
        subscription: Option<&Subscription>,
        now: DateTime<Utc>,
        renewal_window_days: Option<u32>,
    ) -> Self {
        let Some(subscription) = subscription else {
            return Self::Free;
        };
        if subscription.is_expired(now) {
            return Self::Lapsed;
        }
        match renewal_window_days {
            Some(days) if subscription.expiry_date - now <= Duration::days(i64::from(days)) => {
                Self::ExpiringSoon
            }
            _ => Self::ActiveTerm,
        }
    }

    /// Returns `true` while a paid term is running.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::ActiveTerm | Self::ExpiringSoon)
    }

    /// Returns `true` if a purchase of `target` is permitted.
    ///
    /// A lapsed record blocks purchases of its own tier until it is demoted
    /// to `Free`; other tiers may be bought over it.
    #[must_use]
    pub fn allows_purchase(self, current: Option<&Subscription>, target: PlanTitle) -> bool {
        match self {
            Self::Free => true,
            Self::Lapsed => current.is_none_or(|record| record.plan_title != target),
            Self::ActiveTerm | Self::ExpiringSoon => false,
        }
    }

    /// Returns `true` if a renewal is permitted.
    ///
    /// Without a configured window any running term may renew.
    #[must_use]
    pub const fn allows_renewal(self, window_enforced: bool) -> bool {
        match self {
            Self::ExpiringSoon => true,
            Self::ActiveTerm => !window_enforced,
            Self::Free | Self::Lapsed => false,
        }
    }
}

/// Snapshot returned by [`plan_state`](super::SubscriptionReconciler::plan_state).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStatus {
    /// Lifecycle state.
    pub state: PlanState,
    /// Tier shown on the account.
    pub current_plan: PlanTier,
    /// Remaining quotas.
    pub quotas: Quotas,
    /// Term end, when a subscription exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<DateTime<Utc>>,
    /// Whole days until expiry, negative once lapsed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_until_expiry: Option<i64>,
}

impl PlanStatus {
    pub(crate) fn new(
        user: &UserAccount,
        subscription: Option<&Subscription>,
        now: DateTime<Utc>,
        renewal_window_days: Option<u32>,
    ) -> Self {
        Self {
            state: PlanState::classify(subscription, now, renewal_window_days),
            current_plan: user.current_plan,
            quotas: user.quotas,
            expiry_date: subscription.map(|s| s.expiry_date),
            days_until_expiry: subscription.map(|s| s.days_until_expiry(now)),
        }
    }
}

/// Price and entitlement change an upgrade would cause, without applying it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradePreview {
    /// Tier today.
    pub current_plan: PlanTier,
    /// Tier after upgrading.
    pub target_plan: PlanTier,
    /// Proration breakdown; `quote.price` is what the gateway should charge.
    pub quote: ProrationQuote,
    /// Change to the user's counters (clamped at zero when applied).
    pub quota_delta: Quotas,
}
