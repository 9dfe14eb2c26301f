//! Prorated upgrade pricing.
//!
//! Credits the unused share of the current term against the price of the
//! target plan. The only fractional quantity is the remaining credit; it is
//! rounded once, according to [`RoundingMode`], so every price this module
//! returns is an exact integer amount.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy, prelude::ToPrimitive};
use serde::{Deserialize, Serialize};

use crate::catalog::{Money, PlanDefinition};

/// How the remaining credit is rounded to whole minor units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingMode {
    /// Round half away from zero (`4499.5` becomes `4500`).
    #[default]
    HalfUp,
    /// Truncate toward zero, favouring the merchant.
    Floor,
}

impl RoundingMode {
    fn apply(self, value: Decimal) -> Decimal {
        match self {
            Self::HalfUp => value.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero),
            Self::Floor => value.floor(),
        }
    }
}

/// The paid term an upgrade is credited against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingPeriod {
    /// Term start.
    pub start: DateTime<Utc>,
    /// Term end.
    pub expiry: DateTime<Utc>,
    /// Amount actually charged for the term.
    pub price_paid: Money,
}

/// Breakdown of an upgrade price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProrationQuote {
    /// Whole days in the current term.
    pub total_days: i64,
    /// Whole days already used, never negative.
    pub elapsed_days: i64,
    /// Rounded credit for the unused share of the term.
    pub remaining_credit: Money,
    /// Amount to charge for the upgrade.
    pub price: Money,
}

impl ProrationQuote {
    fn full_price(total_days: i64, elapsed_days: i64, price: Money) -> Self {
        Self { total_days, elapsed_days, remaining_credit: Money::ZERO, price }
    }
}

/// Pure upgrade price calculator.
///
/// # Examples
///
/// ```
/// use chrono::{Duration, TimeZone, Utc};
/// use plan_reconciler::{
///     catalog::{Money, PlanCatalog, PlanTitle},
///     proration::{BillingPeriod, ProrationCalculator, RoundingMode},
/// };
///
/// let catalog = PlanCatalog::standard();
/// let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
/// let period = BillingPeriod {
///     start,
///     expiry: start + Duration::days(90),
///     price_paid: Money::from_minor(8_999),
/// };
///
/// let calculator = ProrationCalculator::new(RoundingMode::HalfUp);
/// let quote = calculator.quote(
///     &period,
///     catalog.lookup(PlanTitle::Annual).unwrap(),
///     start + Duration::days(45),
/// );
/// assert_eq!(quote.price, Money::from_minor(25_488));
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct ProrationCalculator {
    rounding: RoundingMode,
}

impl ProrationCalculator {
    /// Creates a calculator with the given rounding mode.
    #[must_use]
    pub const fn new(rounding: RoundingMode) -> Self {
        Self { rounding }
    }

    /// Rounding mode in use.
    #[must_use]
    pub const fn rounding(&self) -> RoundingMode {
        self.rounding
    }

    /// Prices an upgrade from `current` to `new_plan` at `now`.
    ///
    /// Falls back to the full price of `new_plan` when the current term is
    /// empty, already used up, or the arithmetic overflows. The returned price
    /// is never negative.
    #[must_use]
    pub fn quote(
        &self,
        current: &BillingPeriod,
        new_plan: &PlanDefinition,
        now: DateTime<Utc>,
    ) -> ProrationQuote {
        let total_days = (current.expiry - current.start).num_days();
        let elapsed_days = (now - current.start).num_days().max(0);

        if total_days <= 0 || elapsed_days >= total_days {
            return ProrationQuote::full_price(total_days, elapsed_days, new_plan.price);
        }

        let Some(credit) = self.remaining_credit(current.price_paid, elapsed_days, total_days)
        else {
            tracing::warn!(
                price_paid = current.price_paid.minor(),
                total_days,
                elapsed_days,
                "Proration overflow, charging full price"
            );
            return ProrationQuote::full_price(total_days, elapsed_days, new_plan.price);
        };

        let price = new_plan
            .price
            .minor()
            .checked_sub(credit.minor())
            .map_or(new_plan.price, |p| Money::from_minor(p.max(0)));

        ProrationQuote { total_days, elapsed_days, remaining_credit: credit, price }
    }

    /// Rounded credit for the unused share of a term.
    ///
    /// Returns `None` on arithmetic overflow or a non-positive term.
    #[must_use]
    pub fn remaining_credit(
        &self,
        price_paid: Money,
        elapsed_days: i64,
        total_days: i64,
    ) -> Option<Money> {
        if total_days <= 0 {
            return None;
        }
        let elapsed_days = elapsed_days.clamp(0, total_days);
        let paid = Decimal::from(price_paid.minor().max(0));

        let used = paid
            .checked_mul(Decimal::from(elapsed_days))?
            .checked_div(Decimal::from(total_days))?;
        let credit = self.rounding.apply(paid.checked_sub(used)?);

        credit.to_i64().map(|c| Money::from_minor(c.max(0)))
    }
}
