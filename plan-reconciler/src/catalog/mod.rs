//! Static, versioned plan catalog.
//!
//! The catalog is loaded once at startup (built-in or from configuration),
//! validated, and then shared read-only behind an `Arc`. Nothing in the
//! engine reads plan data from anywhere else.
//!
//! # Examples
//!
//! ```
//! use plan_reconciler::catalog::{PlanCatalog, PlanTitle};
//!
//! let catalog = PlanCatalog::standard();
//! let annual = catalog.lookup(PlanTitle::Annual).unwrap();
//! assert_eq!(annual.term_months, 12);
//! assert!(annual.order > catalog.lookup(PlanTitle::Quarterly).unwrap().order);
//! ```

mod models;

use std::collections::HashSet;

pub use models::{
    FeatureFlags, Money, MoneyBack, PlanDefinition, PlanTier, PlanTitle, Quotas,
};

use crate::error::{ReconcileError, Result};

/// Immutable set of plan definitions, at most one per [`PlanTitle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanCatalog {
    version: u32,
    plans: Vec<PlanDefinition>,
}

impl PlanCatalog {
    /// Returns the built-in catalog.
    #[must_use]
    pub fn standard() -> Self {
        let plans = vec![
            PlanDefinition {
                title: PlanTitle::Quarterly,
                order: 1,
                term_months: 3,
                price: Money::from_minor(8_999),
                original_price: Money::from_minor(11_999),
                quotas: Quotas::new(10, 2, 5),
                features: FeatureFlags {
                    emi: false,
                    sale_assurance: false,
                    social_media: true,
                    tele_calling: false,
                    money_back: MoneyBack::Flag(false),
                },
            },
            PlanDefinition {
                title: PlanTitle::HalfYearly,
                order: 2,
                term_months: 6,
                price: Money::from_minor(15_999),
                original_price: Money::from_minor(23_999),
                quotas: Quotas::new(25, 5, 12),
                features: FeatureFlags {
                    emi: true,
                    sale_assurance: false,
                    social_media: true,
                    tele_calling: true,
                    money_back: MoneyBack::Flag(false),
                },
            },
            PlanDefinition {
                title: PlanTitle::Annual,
                order: 3,
                term_months: 12,
                price: Money::from_minor(29_988),
                original_price: Money::from_minor(47_988),
                quotas: Quotas::new(60, 12, 30),
                features: FeatureFlags {
                    emi: true,
                    sale_assurance: true,
                    social_media: true,
                    tele_calling: true,
                    money_back: MoneyBack::Terms(
                        "Full refund if no sale within the term".to_owned(),
                    ),
                },
            },
        ];
        Self { version: 1, plans }
    }

    /// Builds a catalog from explicit definitions.
    ///
    /// Definitions are sorted by `order`.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::ConfigError`] if:
    /// - `plans` is empty
    /// - a title or an order appears twice
    /// - a higher order does not carry a strictly higher price
    /// - any definition fails [`PlanDefinition::validate`]
    pub fn from_definitions(version: u32, mut plans: Vec<PlanDefinition>) -> Result<Self> {
        if plans.is_empty() {
            return Err(ReconcileError::ConfigError("plan catalog cannot be empty".to_owned()));
        }

        let mut titles = HashSet::new();
        let mut orders = HashSet::new();
        for plan in &plans {
            plan.validate()?;
            if !titles.insert(plan.title) {
                return Err(ReconcileError::ConfigError(format!(
                    "duplicate plan title: {}",
                    plan.title
                )));
            }
            if !orders.insert(plan.order) {
                return Err(ReconcileError::ConfigError(format!(
                    "duplicate plan order: {}",
                    plan.order
                )));
            }
        }

        plans.sort_by_key(|plan| plan.order);
        for pair in plans.windows(2) {
            if let [lower, higher] = pair
                && higher.price <= lower.price
            {
                return Err(ReconcileError::ConfigError(format!(
                    "plan {} ranks above {} but is not priced higher",
                    higher.title, lower.title
                )));
            }
        }

        Ok(Self { version, plans })
    }

    /// Catalog version.
    #[must_use]
    pub const fn version(&self) -> u32 {
        self.version
    }

    /// Definitions in ascending order.
    #[must_use]
    pub fn plans(&self) -> &[PlanDefinition] {
        &self.plans
    }

    /// Looks up a plan definition by title.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::InvalidPlan`] if the catalog has no entry for
    /// `title`.
    pub fn lookup(&self, title: PlanTitle) -> Result<&PlanDefinition> {
        self.plans
            .iter()
            .find(|plan| plan.title == title)
            .ok_or_else(|| ReconcileError::InvalidPlan(title.to_string()))
    }

    /// Parses `title` and looks it up.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::InvalidPlan`] for unparseable or absent titles.
    pub fn lookup_str(&self, title: &str) -> Result<&PlanDefinition> {
        self.lookup(title.parse()?)
    }

    /// Term length of `title` in calendar months.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::InvalidPlan`] if `title` is not in the catalog.
    pub fn duration_months(&self, title: PlanTitle) -> Result<u32> {
        self.lookup(title).map(|plan| plan.term_months)
    }
}

impl Default for PlanCatalog {
    fn default() -> Self {
        Self::standard()
    }
}
