//! Engine configuration.
//!
//! Loaded from TOML. Every field has a default, so an empty file is a valid
//! configuration that uses the standard catalog.
//!
//! ```toml
//! renewal_window_days = 3      # 0 disables the window
//! rounding = "half_up"         # or "floor"
//! amount_tolerance = 100       # minor units
//! store_timeout_ms = 5000
//! notification_timeout_ms = 10000
//!
//! [retry]
//! max_attempts = 3
//! initial_delay_ms = 100
//! max_delay_ms = 5000
//! backoff_multiplier = 2.0
//!
//! [payment]
//! secret_env = "PAYMENT_GATEWAY_SECRET"
//! ```

use std::{path::Path, time::Duration};

use serde::Deserialize;

use crate::{
    catalog::{Money, PlanCatalog, PlanDefinition},
    error::{ReconcileError, Result},
    proration::RoundingMode,
    reconcile::ReconcilerSettings,
    reliability::RetryPolicy,
};

/// Largest renewal window accepted, in days.
const MAX_RENEWAL_WINDOW_DAYS: u32 = 30;

/// Root engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Days before expiry in which renewal is accepted; `0` disables the check.
    #[serde(default = "default_renewal_window_days")]
    pub renewal_window_days: u32,

    /// Rounding of the proration credit.
    #[serde(default)]
    pub rounding: RoundingMode,

    /// Largest accepted gap between expected and confirmed amounts, in minor units.
    #[serde(default = "default_amount_tolerance")]
    pub amount_tolerance: Money,

    /// Bound on each store call, in milliseconds.
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Bound on one invoice delivery attempt, in milliseconds.
    #[serde(default = "default_notification_timeout_ms")]
    pub notification_timeout_ms: u64,

    /// Retry policy for the reconcile unit of work.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Retry policy for invoice delivery.
    #[serde(default)]
    pub notification_retry: RetryConfig,

    /// Gateway settings.
    #[serde(default)]
    pub payment: PaymentConfig,

    /// Version reported by a custom catalog.
    #[serde(default = "default_catalog_version")]
    pub catalog_version: u32,

    /// Custom catalog; empty means the standard catalog.
    #[serde(default)]
    pub plans: Vec<PlanDefinition>,
}

const fn default_renewal_window_days() -> u32 {
    3
}

const fn default_amount_tolerance() -> Money {
    Money::from_minor(100)
}

const fn default_store_timeout_ms() -> u64 {
    5_000
}

const fn default_notification_timeout_ms() -> u64 {
    10_000
}

const fn default_catalog_version() -> u32 {
    1
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            renewal_window_days: default_renewal_window_days(),
            rounding: RoundingMode::default(),
            amount_tolerance: default_amount_tolerance(),
            store_timeout_ms: default_store_timeout_ms(),
            notification_timeout_ms: default_notification_timeout_ms(),
            retry: RetryConfig::default(),
            notification_retry: RetryConfig::default(),
            payment: PaymentConfig::default(),
            catalog_version: default_catalog_version(),
            plans: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::ConfigError`] if the document does not parse
    /// or fails [`validate`](Self::validate).
    ///
    /// # Examples
    ///
    /// ```
    /// use plan_reconciler::config::EngineConfig;
    ///
    /// let config = EngineConfig::from_toml("renewal_window_days = 0").unwrap();
    /// assert_eq!(config.renewal_window(), None);
    /// ```
    pub fn from_toml(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)
            .map_err(|e| ReconcileError::ConfigError(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::ConfigError`] if the file cannot be read or
    /// [`from_toml`](Self::from_toml) fails.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            ReconcileError::ConfigError(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml(&source)
    }

    /// Checks value ranges and, when present, the custom catalog.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::ConfigError`] on the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.renewal_window_days > MAX_RENEWAL_WINDOW_DAYS {
            return Err(ReconcileError::ConfigError(format!(
                "renewal_window_days must be at most {MAX_RENEWAL_WINDOW_DAYS}, got {}",
                self.renewal_window_days
            )));
        }
        if self.amount_tolerance.is_negative() {
            return Err(ReconcileError::ConfigError(
                "amount_tolerance must not be negative".to_owned(),
            ));
        }
        if self.store_timeout_ms == 0 {
            return Err(ReconcileError::ConfigError("store_timeout_ms must be > 0".to_owned()));
        }
        if self.notification_timeout_ms == 0 {
            return Err(ReconcileError::ConfigError(
                "notification_timeout_ms must be > 0".to_owned(),
            ));
        }
        self.retry.validate("retry")?;
        self.notification_retry.validate("notification_retry")?;
        self.payment.validate()?;
        if !self.plans.is_empty() {
            self.catalog()?;
        }
        Ok(())
    }

    /// Renewal window, `None` when disabled.
    #[must_use]
    pub const fn renewal_window(&self) -> Option<u32> {
        match self.renewal_window_days {
            0 => None,
            days => Some(days),
        }
    }

    /// Builds the plan catalog: the custom plans if any, else the standard one.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::ConfigError`] if the custom plans break a
    /// catalog invariant.
    pub fn catalog(&self) -> Result<PlanCatalog> {
        if self.plans.is_empty() {
            return Ok(PlanCatalog::standard());
        }
        PlanCatalog::from_definitions(self.catalog_version, self.plans.clone())
    }

    /// Reconciler settings derived from this configuration.
    #[must_use]
    pub fn settings(&self) -> ReconcilerSettings {
        ReconcilerSettings::from(self)
    }
}

impl From<&EngineConfig> for ReconcilerSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            renewal_window_days: config.renewal_window(),
            rounding: config.rounding,
            amount_tolerance: config.amount_tolerance,
            store_timeout: Duration::from_millis(config.store_timeout_ms),
            notification_timeout: Duration::from_millis(config.notification_timeout_ms),
            retry: config.retry.to_policy(),
            notification_retry: config.notification_retry.to_policy(),
        }
    }
}

/// Retry settings as written in the file.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Attempts including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Delay cap.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Growth factor per attempt.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_initial_delay_ms() -> u64 {
    100
}

const fn default_max_delay_ms() -> u64 {
    5_000
}

const fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryConfig {
    fn validate(&self, section: &str) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ReconcileError::ConfigError(format!(
                "[{section}] max_attempts must be >= 1"
            )));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ReconcileError::ConfigError(format!(
                "[{section}] backoff_multiplier must be >= 1.0"
            )));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(ReconcileError::ConfigError(format!(
                "[{section}] max_delay_ms must be >= initial_delay_ms"
            )));
        }
        Ok(())
    }

    /// Converts to a [`RetryPolicy`].
    #[must_use]
    pub const fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
        }
    }
}

/// Gateway settings. The secret itself never lives in the file.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentConfig {
    /// Environment variable holding the shared gateway secret.
    #[serde(default = "default_secret_env")]
    pub secret_env: String,
}

fn default_secret_env() -> String {
    "PAYMENT_GATEWAY_SECRET".to_owned()
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self { secret_env: default_secret_env() }
    }
}

impl PaymentConfig {
    fn validate(&self) -> Result<()> {
        validate_env_var_name(&self.secret_env)
    }

    /// Reads the gateway secret from the configured environment variable.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::ConfigError`] if the variable is unset or empty.
    pub fn load_secret(&self) -> Result<Vec<u8>> {
        match std::env::var(&self.secret_env) {
            Ok(secret) if !secret.is_empty() => Ok(secret.into_bytes()),
            _ => Err(ReconcileError::ConfigError(format!(
                "environment variable {} is not set",
                self.secret_env
            ))),
        }
    }
}

/// Upper-case letters, digits and underscores, not starting with a digit.
fn validate_env_var_name(name: &str) -> Result<()> {
    let Some(first) = name.chars().next() else {
        return Err(ReconcileError::ConfigError(
            "environment variable name cannot be empty".to_owned(),
        ));
    };
    if first.is_ascii_digit() {
        return Err(ReconcileError::ConfigError(format!(
            "environment variable name must not start with a digit: {name}"
        )));
    }
    if let Some(ch) =
        name.chars().find(|c| !(c.is_ascii_uppercase() || c.is_ascii_digit() || *c == '_'))
    {
        return Err(ReconcileError::ConfigError(format!(
            "environment variable name contains invalid character '{ch}': {name}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PlanTitle;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = EngineConfig::from_toml("").unwrap();
        assert_eq!(config.renewal_window(), Some(3));
        assert_eq!(config.rounding, RoundingMode::HalfUp);
        assert_eq!(config.amount_tolerance, Money::from_minor(100));
        assert_eq!(config.payment.secret_env, "PAYMENT_GATEWAY_SECRET");
        assert_eq!(config.catalog().unwrap(), PlanCatalog::standard());
    }

    #[test]
    fn test_full_config() {
        let toml = r#"
            renewal_window_days = 7
            rounding = "floor"
            amount_tolerance = 0
            store_timeout_ms = 250
            notification_timeout_ms = 1000

            [retry]
            max_attempts = 5
            initial_delay_ms = 10
            max_delay_ms = 200
            backoff_multiplier = 1.5

            [payment]
            secret_env = "RAZORPAY_KEY_SECRET"
        "#;

        let config = EngineConfig::from_toml(toml).unwrap();
        let settings = config.settings();
        assert_eq!(settings.renewal_window_days, Some(7));
        assert_eq!(settings.rounding, RoundingMode::Floor);
        assert_eq!(settings.amount_tolerance, Money::ZERO);
        assert_eq!(settings.store_timeout, Duration::from_millis(250));
        assert_eq!(settings.retry.max_attempts, 5);
        assert_eq!(settings.retry.initial_delay, Duration::from_millis(10));
        assert_eq!(settings.notification_retry.max_attempts, 3);
    }

    #[test]
    fn test_zero_window_disables_check() {
        let config = EngineConfig::from_toml("renewal_window_days = 0").unwrap();
        assert_eq!(config.settings().renewal_window_days, None);
    }

    #[test]
    fn test_window_too_large() {
        let err = EngineConfig::from_toml("renewal_window_days = 31").unwrap_err();
        assert!(err.to_string().contains("renewal_window_days"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(EngineConfig::from_toml("amount_tolerance = -1").is_err());
        assert!(EngineConfig::from_toml("store_timeout_ms = 0").is_err());
        assert!(EngineConfig::from_toml("[retry]\nmax_attempts = 0").is_err());
        assert!(EngineConfig::from_toml("[retry]\nbackoff_multiplier = 0.5").is_err());
        assert!(EngineConfig::from_toml("rounding = \"banker\"").is_err());
    }

    #[test]
    fn test_env_var_name_validation() {
        assert!(validate_env_var_name("PAYMENT_SECRET_2").is_ok());
        assert!(validate_env_var_name("").is_err());
        assert!(validate_env_var_name("2SECRET").is_err());
        assert!(validate_env_var_name("secret").is_err());
        assert!(validate_env_var_name("SECRET;rm").is_err());
        assert!(EngineConfig::from_toml("[payment]\nsecret_env = \"a-b\"").is_err());
    }

    #[test]
    fn test_custom_catalog() {
        let toml = r#"
            catalog_version = 2

            [[plans]]
            title = "Quarterly"
            order = 1
            termMonths = 3
            price = 9999
            originalPrice = 12999
            quotas = { listings = 12, premiumBadging = 3, shows = 6 }

            [[plans]]
            title = "Annual"
            order = 2
            termMonths = 12
            price = 34999
            originalPrice = 49999
            quotas = { listings = 80, premiumBadging = 15, shows = 40 }
            features = { emi = true, moneyBack = "Full refund within 30 days" }
        "#;

        let catalog = EngineConfig::from_toml(toml).unwrap().catalog().unwrap();
        assert_eq!(catalog.version(), 2);
        assert_eq!(catalog.plans().len(), 2);
        assert_eq!(catalog.lookup(PlanTitle::Annual).unwrap().price, Money::from_minor(34_999));
        assert!(catalog.lookup(PlanTitle::HalfYearly).is_err());
    }

    #[test]
    fn test_custom_catalog_must_be_ordered_by_price() {
        let toml = r#"
            [[plans]]
            title = "Quarterly"
            order = 2
            termMonths = 3
            price = 9999
            originalPrice = 9999
            quotas = {}

            [[plans]]
            title = "Annual"
            order = 1
            termMonths = 12
            price = 19999
            originalPrice = 19999
            quotas = {}
        "#;
        assert!(EngineConfig::from_toml(toml).is_err());
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("engine-config-{}.toml", std::process::id()));
        std::fs::write(&path, "rounding = \"floor\"\n").unwrap();
        let config = EngineConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.rounding, RoundingMode::Floor);

        assert!(EngineConfig::from_file("/nonexistent/engine.toml").is_err());
    }

    #[test]
    fn test_missing_secret() {
        let payment = PaymentConfig { secret_env: "PLAN_RECONCILER_TEST_UNSET_SECRET".to_owned() };
        assert!(payment.load_secret().is_err());
    }
}
