//! Plan catalog data models.
//!
//! Money is carried as integer minor units (paise/cents) everywhere; only
//! the proration step touches fractional values, and it rounds back to
//! [`Money`] before anything is stored.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::{ReconcileError, Result};

/// Monetary amount in the smallest currency unit.
///
/// Single-currency by construction; there is no currency code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    /// Zero amount.
    pub const ZERO: Self = Self(0);

    /// Creates an amount from minor units.
    #[must_use]
    pub const fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    /// Returns the amount in minor units.
    #[must_use]
    pub const fn minor(self) -> i64 {
        self.0
    }

    /// Returns `true` when the amount is below zero.
    #[must_use]
    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// Absolute difference between two amounts.
    #[must_use]
    pub const fn abs_diff(self, other: Self) -> u64 {
        self.0.abs_diff(other.0)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Purchasable tier.
///
/// The free tier is not a catalog entry; see [`PlanTier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlanTitle {
    /// Three-month term.
    Quarterly,
    /// Six-month term.
    #[serde(alias = "Half-Yearly", alias = "Half Yearly")]
    HalfYearly,
    /// Twelve-month term.
    #[serde(alias = "Annually", alias = "Yearly")]
    Annual,
}

impl PlanTitle {
    /// All purchasable titles.
    pub const ALL: [Self; 3] = [Self::Quarterly, Self::HalfYearly, Self::Annual];

    /// Returns the canonical name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Quarterly => "Quarterly",
            Self::HalfYearly => "HalfYearly",
            Self::Annual => "Annual",
        }
    }
}

impl fmt::Display for PlanTitle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanTitle {
    type Err = ReconcileError;

    /// Parses a plan title, ignoring case, spaces and hyphens.
    ///
    /// # Examples
    ///
    /// ```
    /// use plan_reconciler::catalog::PlanTitle;
    ///
    /// assert_eq!("half-yearly".parse::<PlanTitle>().unwrap(), PlanTitle::HalfYearly);
    /// assert!("Free".parse::<PlanTitle>().is_err());
    /// ```
    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "quarterly" => Ok(Self::Quarterly),
            "halfyearly" => Ok(Self::HalfYearly),
            "annual" | "annually" | "yearly" => Ok(Self::Annual),
            _ => Err(ReconcileError::InvalidPlan(s.to_owned())),
        }
    }
}

/// Tier currently shown on a user account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PlanTier {
    /// No paid plan.
    #[default]
    Free,
    /// A paid catalog tier.
    Paid(PlanTitle),
}

impl PlanTier {
    /// Returns the paid title, if any.
    #[must_use]
    pub const fn title(self) -> Option<PlanTitle> {
        match self {
            Self::Free => None,
            Self::Paid(title) => Some(title),
        }
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Free => f.write_str("Free"),
            Self::Paid(title) => title.fmt(f),
        }
    }
}

impl From<PlanTier> for String {
    fn from(tier: PlanTier) -> Self {
        tier.to_string()
    }
}

impl TryFrom<String> for PlanTier {
    type Error = ReconcileError;

    fn try_from(value: String) -> Result<Self> {
        if value.eq_ignore_ascii_case("free") {
            Ok(Self::Free)
        } else {
            value.parse().map(Self::Paid)
        }
    }
}

/// Consumable entitlement counters.
///
/// Used both for what a plan grants per term and for what a user has left.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Quotas {
    /// Property listings.
    pub listings: i64,
    /// Premium badging slots.
    pub premium_badging: i64,
    /// Property shows.
    pub shows: i64,
}

impl Quotas {
    /// Creates a quota set.
    #[must_use]
    pub const fn new(listings: i64, premium_badging: i64, shows: i64) -> Self {
        Self { listings, premium_badging, shows }
    }

    /// Component-wise `self - other`.
    ///
    /// The result may be negative; it is a delta, not a balance.
    #[must_use]
    pub const fn delta_from(self, other: Self) -> Self {
        Self {
            listings: self.listings.saturating_sub(other.listings),
            premium_badging: self.premium_badging.saturating_sub(other.premium_badging),
            shows: self.shows.saturating_sub(other.shows),
        }
    }

    /// Applies a delta and clamps every counter at zero.
    #[must_use]
    pub fn apply_delta(self, delta: Self) -> Self {
        Self {
            listings: self.listings.saturating_add(delta.listings).max(0),
            premium_badging: self.premium_badging.saturating_add(delta.premium_badging).max(0),
            shows: self.shows.saturating_add(delta.shows).max(0),
        }
    }

    /// Returns `true` when any counter is negative.
    #[must_use]
    pub const fn has_negative(self) -> bool {
        self.listings < 0 || self.premium_badging < 0 || self.shows < 0
    }
}

/// Money-back guarantee: either a flag or free-form terms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MoneyBack {
    /// Guarantee offered or not.
    Flag(bool),
    /// Guarantee with written terms.
    Terms(String),
}

impl Default for MoneyBack {
    fn default() -> Self {
        Self::Flag(false)
    }
}

/// Feature flags granted by a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlags {
    /// EMI (installment) assistance.
    #[serde(default)]
    pub emi: bool,
    /// Sale assurance.
    #[serde(default)]
    pub sale_assurance: bool,
    /// Social media promotion.
    #[serde(default)]
    pub social_media: bool,
    /// Tele-calling support.
    #[serde(default)]
    pub tele_calling: bool,
    /// Money-back guarantee.
    #[serde(default)]
    pub money_back: MoneyBack,
}

/// Immutable catalog entry for a purchasable tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanDefinition {
    /// Tier title.
    pub title: PlanTitle,
    /// Rank; higher means more valuable.
    pub order: u8,
    /// Length of one billing term in calendar months.
    pub term_months: u32,
    /// Price charged, in minor units.
    pub price: Money,
    /// List price before discount, in minor units.
    pub original_price: Money,
    /// Quotas granted per term.
    pub quotas: Quotas,
    /// Feature flags.
    #[serde(default)]
    pub features: FeatureFlags,
}

impl PlanDefinition {
    /// Validates a single definition.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::ConfigError`] if the term is zero, any amount is
    /// negative, or any quota is negative.
    pub fn validate(&self) -> Result<()> {
        if self.term_months == 0 {
            return Err(ReconcileError::ConfigError(format!(
                "plan {} must have term_months > 0",
                self.title
            )));
        }
        if self.price.is_negative() || self.original_price.is_negative() {
            return Err(ReconcileError::ConfigError(format!(
                "plan {} prices must not be negative",
                self.title
            )));
        }
        if self.quotas.has_negative() {
            return Err(ReconcileError::ConfigError(format!(
                "plan {} quotas must not be negative",
                self.title
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_title_parse_variants() {
        assert_eq!("Quarterly".parse::<PlanTitle>().unwrap(), PlanTitle::Quarterly);
        assert_eq!("Half-Yearly".parse::<PlanTitle>().unwrap(), PlanTitle::HalfYearly);
        assert_eq!("half yearly".parse::<PlanTitle>().unwrap(), PlanTitle::HalfYearly);
        assert_eq!("ANNUAL".parse::<PlanTitle>().unwrap(), PlanTitle::Annual);
        assert_eq!("Annually".parse::<PlanTitle>().unwrap(), PlanTitle::Annual);
    }

    #[test]
    fn test_plan_title_parse_rejects_unknown() {
        let result = "Platinum".parse::<PlanTitle>();
        assert!(matches!(result, Err(ReconcileError::InvalidPlan(ref t)) if t == "Platinum"));
        assert!("".parse::<PlanTitle>().is_err());
    }

    #[test]
    fn test_plan_tier_serde() {
        let json = serde_json::to_string(&PlanTier::Paid(PlanTitle::HalfYearly)).unwrap();
        assert_eq!(json, "\"HalfYearly\"");

        let free: PlanTier = serde_json::from_str("\"Free\"").unwrap();
        assert_eq!(free, PlanTier::Free);

        let paid: PlanTier = serde_json::from_str("\"Half-Yearly\"").unwrap();
        assert_eq!(paid, PlanTier::Paid(PlanTitle::HalfYearly));

        assert!(serde_json::from_str::<PlanTier>("\"Gold\"").is_err());
    }

    #[test]
    fn test_quota_delta_can_be_negative() {
        let old = Quotas::new(10, 2, 5);
        let new = Quotas::new(6, 4, 5);
        assert_eq!(new.delta_from(old), Quotas::new(-4, 2, 0));
    }

    #[test]
    fn test_apply_delta_clamps_at_zero() {
        let balance = Quotas::new(3, 1, 0);
        let after = balance.apply_delta(Quotas::new(-4, 2, -1));
        assert_eq!(after, Quotas::new(0, 3, 0));
        assert!(!after.has_negative());
    }

    #[test]
    fn test_money_back_untagged() {
        let flag: MoneyBack = serde_json::from_str("true").unwrap();
        assert_eq!(flag, MoneyBack::Flag(true));

        let terms: MoneyBack = serde_json::from_str("\"within 30 days\"").unwrap();
        assert_eq!(terms, MoneyBack::Terms("within 30 days".to_owned()));
    }

    #[test]
    fn test_definition_validate_rejects_zero_term() {
        let plan = PlanDefinition {
            title: PlanTitle::Quarterly,
            order: 1,
            term_months: 0,
            price: Money::from_minor(100),
            original_price: Money::from_minor(100),
            quotas: Quotas::default(),
            features: FeatureFlags::default(),
        };
        assert!(matches!(plan.validate(), Err(ReconcileError::ConfigError(_))));
    }
}
