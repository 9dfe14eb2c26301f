//! Logging setup and health reporting for the reconciler server.

use std::io;

use plan_reconciler::EngineConfig;
use serde::Serialize;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, for development.
    Pretty,
    /// One JSON object per line, for log aggregation.
    Json,
}

impl LogFormat {
    /// Reads `LOG_FORMAT`: `json` selects JSON, anything else pretty.
    #[must_use]
    pub fn from_env() -> Self {
        Self::parse(&std::env::var("LOG_FORMAT").unwrap_or_default())
    }

    fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") { Self::Json } else { Self::Pretty }
    }
}

/// Installs the global tracing subscriber on stderr; stdout carries responses.
///
/// `RUST_LOG` picks the filter (default `info`). Audit events log under the
/// `audit` target and invoices under `invoice`.
///
/// # Errors
///
/// Fails if a global subscriber is already set.
pub fn init_observability(format: LogFormat) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (pretty, json) = match format {
        LogFormat::Pretty => (Some(fmt::layer().with_writer(io::stderr)), None),
        LogFormat::Json => (
            None,
            Some(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_span_list(false)
                    .with_writer(io::stderr),
            ),
        ),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(pretty.map(|layer| layer.with_span_events(FmtSpan::CLOSE)))
        .with(json.map(|layer| layer.with_span_events(FmtSpan::CLOSE)))
        .try_init()
}

/// Overall health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Everything passed.
    Healthy,
    /// Running with a warning.
    Degraded,
    /// A required check failed.
    Unhealthy,
}

/// Result of one check, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckStatus {
    /// Passed.
    Pass,
    /// Degraded but operational.
    Warn,
    /// Failed.
    Fail,
}

/// One named check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    /// Check name.
    pub name: String,
    /// Outcome.
    pub status: HealthCheckStatus,
    /// Detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HealthCheck {
    fn new(name: &str, status: HealthCheckStatus, message: impl Into<String>) -> Self {
        Self { name: name.to_owned(), status, message: Some(message.into()) }
    }
}

/// Health report returned for a `{"health": true}` command.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// Worst status among the checks.
    pub status: HealthStatus,
    /// Server version.
    pub version: &'static str,
    /// Seconds since startup.
    pub uptime_secs: u64,
    /// Individual checks.
    pub checks: Vec<HealthCheck>,
}

impl HealthReport {
    /// Checks the configuration the server is running with.
    #[must_use]
    pub fn collect(config: &EngineConfig, secret_loaded: bool, uptime_secs: u64) -> Self {
        let mut checks = Vec::new();

        checks.push(if secret_loaded {
            HealthCheck::new("gateway_secret", HealthCheckStatus::Pass, "loaded")
        } else {
            HealthCheck::new(
                "gateway_secret",
                HealthCheckStatus::Fail,
                format!("{} is empty", config.payment.secret_env),
            )
        });

        checks.push(match config.catalog() {
            Ok(catalog) => HealthCheck::new(
                "catalog",
                HealthCheckStatus::Pass,
                format!("version {}, {} plans", catalog.version(), catalog.plans().len()),
            ),
            Err(e) => HealthCheck::new("catalog", HealthCheckStatus::Fail, e.to_string()),
        });

        checks.push(match config.renewal_window() {
            Some(days) => {
                HealthCheck::new("renewal_window", HealthCheckStatus::Pass, format!("{days} days"))
            }
            None => HealthCheck::new(
                "renewal_window",
                HealthCheckStatus::Warn,
                "disabled; renewals accepted at any time",
            ),
        });

        Self {
            status: Self::compute_status(&checks),
            version: env!("CARGO_PKG_VERSION"),
            uptime_secs,
            checks,
        }
    }

    /// Worst status among `checks`.
    #[must_use]
    pub fn compute_status(checks: &[HealthCheck]) -> HealthStatus {
        match checks.iter().map(|check| check.status).max() {
            Some(HealthCheckStatus::Fail) => HealthStatus::Unhealthy,
            Some(HealthCheckStatus::Warn) => HealthStatus::Degraded,
            Some(HealthCheckStatus::Pass) | None => HealthStatus::Healthy,
        }
    }
}
