//! User and subscription records.

use std::fmt;

use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    catalog::{FeatureFlags, Money, PlanDefinition, PlanTier, PlanTitle, Quotas},
    error::{ReconcileError, Result},
    proration::BillingPeriod,
};

/// Maximum identifier length accepted at the boundary.
const MAX_ID_LEN: usize = 64;

/// Checks an externally supplied identifier.
///
/// Allowed: ASCII alphanumerics, hyphens and underscores, 1 to 64 characters.
fn validate_identifier(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(ReconcileError::InvalidRequest(format!("{field} cannot be empty")));
    }
    if value.len() > MAX_ID_LEN {
        return Err(ReconcileError::InvalidRequest(format!(
            "{field} must be {MAX_ID_LEN} characters or less"
        )));
    }
    if !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(ReconcileError::InvalidRequest(format!(
            "{field} can only contain alphanumeric characters, hyphens, and underscores"
        )));
    }
    Ok(())
}

/// Unique identifier for a user account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Creates a user ID after validation.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::InvalidRequest`] if the ID is empty, longer than
    /// 64 characters, or contains characters other than alphanumerics, hyphens
    /// and underscores.
    pub fn new<S: Into<String>>(id: S) -> Result<Self> {
        let id = id.into();
        validate_identifier("user_id", &id)?;
        Ok(Self(id))
    }

    /// Returns the inner string reference.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for a subscription record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    /// Creates a subscription ID after validation.
    ///
    /// # Errors
    ///
    /// Same rules as [`UserId::new`].
    pub fn new<S: Into<String>>(id: S) -> Result<Self> {
        let id = id.into();
        validate_identifier("subscription_id", &id)?;
        Ok(Self(id))
    }

    /// Generates a fresh random ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("sub_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Returns the inner string reference.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Gateway payment id, used as the idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    /// Creates a transaction ID after validation.
    ///
    /// # Errors
    ///
    /// Same rules as [`UserId::new`].
    pub fn new<S: Into<String>>(id: S) -> Result<Self> {
        let id = id.into();
        validate_identifier("payment_id", &id)?;
        Ok(Self(id))
    }

    /// Returns the inner string reference.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Gateway order id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(String);

impl OrderId {
    /// Creates an order ID after validation.
    ///
    /// # Errors
    ///
    /// Same rules as [`UserId::new`].
    pub fn new<S: Into<String>>(id: S) -> Result<Self> {
        let id = id.into();
        validate_identifier("order_id", &id)?;
        Ok(Self(id))
    }

    /// Returns the inner string reference.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A user account as the engine sees it.
///
/// `current_plan` is `Free` exactly when `active_plan_id` is `None`. Quota
/// counters are only changed by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAccount {
    /// Account id.
    pub id: UserId,
    /// Invoice recipient.
    pub email: String,
    /// Tier shown on the account.
    #[serde(default)]
    pub current_plan: PlanTier,
    /// Remaining quotas.
    #[serde(flatten)]
    pub quotas: Quotas,
    /// Current subscription record, if any.
    #[serde(default)]
    pub active_plan_id: Option<SubscriptionId>,
    /// Optimistic concurrency token, bumped by every committed write.
    #[serde(default)]
    pub version: u64,
}

impl UserAccount {
    /// Creates a free-tier account with empty quotas.
    #[must_use]
    pub fn new(id: UserId, email: impl Into<String>) -> Self {
        Self {
            id,
            email: email.into(),
            current_plan: PlanTier::Free,
            quotas: Quotas::default(),
            active_plan_id: None,
            version: 0,
        }
    }

    /// Returns `true` when tier and subscription link agree and no counter is
    /// negative.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let linked = matches!(self.current_plan, PlanTier::Free) == self.active_plan_id.is_none();
        linked && !self.quotas.has_negative()
    }
}

/// Purchase record for one paid term.
///
/// Renewals and upgrades overwrite the record in place and bump `revision`;
/// stores keep the superseded revisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    /// Record id.
    pub id: SubscriptionId,
    /// Owner.
    pub user_id: UserId,
    /// Tier purchased.
    pub plan_title: PlanTitle,
    /// Term start.
    pub start_date: DateTime<Utc>,
    /// Term end, `start_date` plus the plan's term in calendar months.
    pub expiry_date: DateTime<Utc>,
    /// Gateway payment id; unique across every revision ever stored.
    pub transaction_id: TransactionId,
    /// Gateway order id.
    pub order_id: OrderId,
    /// Amount charged for this revision.
    pub price_paid: Money,
    /// List price of the tier at purchase.
    pub original_price: Money,
    /// Amount the engine computed; differs from `price_paid` only within tolerance.
    pub expected_price: Money,
    /// Quotas granted by the tier.
    pub quotas: Quotas,
    /// Features granted by the tier.
    pub features: FeatureFlags,
    /// First creation time of the record.
    pub created_at: DateTime<Utc>,
    /// Last overwrite time.
    pub updated_at: DateTime<Utc>,
    /// Overwrite counter, starting at 1.
    pub revision: u32,
}

/// Payment facts attached to a new subscription revision.
#[derive(Debug, Clone)]
pub struct PaymentRecord {
    /// Gateway payment id.
    pub transaction_id: TransactionId,
    /// Gateway order id.
    pub order_id: OrderId,
    /// Amount charged.
    pub price_paid: Money,
    /// Amount the engine expected.
    pub expected_price: Money,
}

/// Adds `months` calendar months to `start`.
///
/// # Errors
///
/// Returns [`ReconcileError::ConfigError`] if the date is out of range.
pub fn term_end(start: DateTime<Utc>, months: u32) -> Result<DateTime<Utc>> {
    start
        .checked_add_months(Months::new(months))
        .filter(|end| *end > start)
        .ok_or_else(|| {
            ReconcileError::ConfigError(format!("cannot add {months} months to {start}"))
        })
}

impl Subscription {
    /// Creates revision 1 of a subscription for `plan`, starting at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::ConfigError`] if the term end is out of range.
    pub fn open(
        user_id: UserId,
        plan: &PlanDefinition,
        payment: PaymentRecord,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        Ok(Self {
            id: SubscriptionId::generate(),
            user_id,
            plan_title: plan.title,
            start_date: now,
            expiry_date: term_end(now, plan.term_months)?,
            transaction_id: payment.transaction_id,
            order_id: payment.order_id,
            price_paid: payment.price_paid,
            original_price: plan.original_price,
            expected_price: payment.expected_price,
            quotas: plan.quotas,
            features: plan.features.clone(),
            created_at: now,
            updated_at: now,
            revision: 1,
        })
    }

    /// Returns the next revision: same record id, new term for `plan` from `now`.
    ///
    /// Used for both renewal (same plan) and upgrade (higher plan).
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::ConfigError`] if the term end is out of range.
    pub fn next_revision(
        &self,
        plan: &PlanDefinition,
        payment: PaymentRecord,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        Ok(Self {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            plan_title: plan.title,
            start_date: now,
            expiry_date: term_end(now, plan.term_months)?,
            transaction_id: payment.transaction_id,
            order_id: payment.order_id,
            price_paid: payment.price_paid,
            original_price: plan.original_price,
            expected_price: payment.expected_price,
            quotas: plan.quotas,
            features: plan.features.clone(),
            created_at: self.created_at,
            updated_at: now,
            revision: self.revision.saturating_add(1),
        })
    }

    /// The paid term, for proration.
    #[must_use]
    pub const fn billing_period(&self) -> BillingPeriod {
        BillingPeriod {
            start: self.start_date,
            expiry: self.expiry_date,
            price_paid: self.price_paid,
        }
    }

    /// Whole days until expiry; negative once lapsed.
    #[must_use]
    pub fn days_until_expiry(&self, now: DateTime<Utc>) -> i64 {
        (self.expiry_date - now).num_days()
    }

    /// Returns `true` once `now` has reached the expiry date.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry_date
    }
}
