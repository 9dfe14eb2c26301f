//! Error types for the plan reconciliation engine.
//!
//! Every failure the engine can report is a variant of [`ReconcileError`].
//! Callers outside the crate see only the coarse [`ErrorKind`] taxonomy
//! (see [`ReconcileError::kind`]); the detailed message stays in logs.
//!
//! # Error Categories
//!
//! - **Validation** ([`ReconcileError::InvalidPlan`], [`ReconcileError::InvalidRequest`],
//!   [`ReconcileError::UserNotFound`]): fix the input and resubmit
//! - **Trust boundary** ([`ReconcileError::PaymentVerificationFailed`]): potential fraud,
//!   never retried automatically
//! - **Lifecycle policy** ([`ReconcileError::NoActivePlan`],
//!   [`ReconcileError::DowngradeNotSupported`], [`ReconcileError::PlanAlreadyActive`],
//!   [`ReconcileError::RenewalNotAllowed`]): the requested transition is not valid for the
//!   user's current state
//! - **Idempotency** ([`ReconcileError::DuplicateTransaction`]): benign, the payment was
//!   already applied
//! - **Storage** ([`ReconcileError::StorageUnavailable`]): retry with the same payment id
//!
//! # Examples
//!
//! ```
//! use plan_reconciler::error::{ErrorKind, ReconcileError};
//!
//! let err = ReconcileError::InvalidPlan("Platinum".to_owned());
//! assert_eq!(err.kind(), ErrorKind::InvalidPlan);
//! assert!(err.kind().is_client_error());
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entitlement::StoreError;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, ReconcileError>;

/// Errors that can occur while reconciling a subscription change.
///
/// # Error Recovery
///
/// - **Validation errors**: safe to show to the end user; resubmit with corrected input
/// - **[`PaymentVerificationFailed`](Self::PaymentVerificationFailed)**: reject with 4xx,
///   never retry
/// - **[`DuplicateTransaction`](Self::DuplicateTransaction)**: display the existing
///   subscription instead of an error
/// - **[`StorageUnavailable`](Self::StorageUnavailable)**: retry later with the same
///   payment id; the engine already de-duplicates
#[must_use = "errors should be handled, propagated, or explicitly panicked"]
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The requested plan title is not in the catalog.
    ///
    /// Never silently defaulted to another tier.
    #[error("Unknown plan: {0}")]
    InvalidPlan(String),

    /// A request field is missing or malformed.
    ///
    /// # Examples
    ///
    /// ```
    /// use plan_reconciler::error::ReconcileError;
    ///
    /// let err = ReconcileError::InvalidRequest("payment_id cannot be empty".to_owned());
    /// assert!(err.to_string().contains("Invalid request"));
    /// ```
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The user referenced by the request does not exist.
    #[error("User not found: {0}")]
    UserNotFound(String),

    /// The payment confirmation signature did not verify.
    ///
    /// Treat as a potential forgery. No state was changed.
    #[error("Payment verification failed for order {order_id}")]
    PaymentVerificationFailed {
        /// Gateway order id from the rejected confirmation.
        order_id: String,
    },

    /// A subscription already exists for this payment id.
    ///
    /// The payment was applied by an earlier call; nothing was changed.
    #[error("Transaction already applied: {0}")]
    DuplicateTransaction(String),

    /// Upgrade or renewal attempted without a current subscription.
    #[error("No active plan for user {0}")]
    NoActivePlan(String),

    /// The target tier does not rank above the current tier.
    #[error("Cannot move from {current} to {target}: only upgrades are supported")]
    DowngradeNotSupported {
        /// Current tier title.
        current: String,
        /// Requested tier title.
        target: String,
    },

    /// Purchase attempted while a paid term is still running, or of the same
    /// tier as a lapsed record that has not been demoted yet.
    #[error("User {0} already holds a plan record blocking this purchase")]
    PlanAlreadyActive(String),

    /// Renewal rejected by the renewal policy (wrong tier or outside the window).
    #[error("Renewal not allowed: {0}")]
    RenewalNotAllowed(String),

    /// The gateway-confirmed amount diverges from the expected price beyond tolerance.
    #[error("Amount mismatch: expected {expected}, gateway confirmed {confirmed}")]
    AmountMismatch {
        /// Amount computed by the engine, in minor units.
        expected: i64,
        /// Amount confirmed by the gateway, in minor units.
        confirmed: i64,
    },

    /// The entitlement store failed or timed out after all retry attempts.
    #[error("Entitlement store unavailable: {0}")]
    StorageUnavailable(#[source] StoreError),

    /// Engine configuration is invalid.
    ///
    /// Raised only while loading configuration or the plan catalog.
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ReconcileError {
    /// Returns the public error kind for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidPlan(_) => ErrorKind::InvalidPlan,
            Self::InvalidRequest(_) | Self::ConfigError(_) => ErrorKind::InvalidRequest,
            Self::UserNotFound(_) => ErrorKind::UserNotFound,
            Self::PaymentVerificationFailed { .. } => ErrorKind::PaymentVerificationFailed,
            Self::DuplicateTransaction(_) => ErrorKind::DuplicateTransaction,
            Self::NoActivePlan(_) => ErrorKind::NoActivePlan,
            Self::DowngradeNotSupported { .. } => ErrorKind::DowngradeNotSupported,
            Self::PlanAlreadyActive(_) => ErrorKind::PlanAlreadyActive,
            Self::RenewalNotAllowed(_) => ErrorKind::RenewalNotAllowed,
            Self::AmountMismatch { .. } => ErrorKind::AmountMismatch,
            Self::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
        }
    }
}

/// Public error taxonomy surfaced in [`ReconcileResult`](crate::reconcile::ReconcileResult).
///
/// Serialized in `SCREAMING_SNAKE_CASE`, e.g. `"DUPLICATE_TRANSACTION"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Unknown target tier.
    InvalidPlan,
    /// Missing or malformed request field.
    InvalidRequest,
    /// Unknown user.
    UserNotFound,
    /// Signature mismatch.
    PaymentVerificationFailed,
    /// Idempotency hit.
    DuplicateTransaction,
    /// No current subscription to upgrade or renew.
    NoActivePlan,
    /// Target tier ranks at or below the current tier.
    DowngradeNotSupported,
    /// Purchase while a paid term is running.
    PlanAlreadyActive,
    /// Renewal policy rejected the request.
    RenewalNotAllowed,
    /// Expected and confirmed amounts diverge beyond tolerance.
    AmountMismatch,
    /// Persistence failed after retries.
    StorageUnavailable,
}

impl ErrorKind {
    /// Returns the wire name of this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidPlan => "INVALID_PLAN",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::UserNotFound => "USER_NOT_FOUND",
            Self::PaymentVerificationFailed => "PAYMENT_VERIFICATION_FAILED",
            Self::DuplicateTransaction => "DUPLICATE_TRANSACTION",
            Self::NoActivePlan => "NO_ACTIVE_PLAN",
            Self::DowngradeNotSupported => "DOWNGRADE_NOT_SUPPORTED",
            Self::PlanAlreadyActive => "PLAN_ALREADY_ACTIVE",
            Self::RenewalNotAllowed => "RENEWAL_NOT_ALLOWED",
            Self::AmountMismatch => "AMOUNT_MISMATCH",
            Self::StorageUnavailable => "STORAGE_UNAVAILABLE",
        }
    }

    /// Returns `true` when the caller caused the failure (HTTP 4xx semantics).
    #[must_use]
    pub const fn is_client_error(self) -> bool {
        !matches!(self, Self::StorageUnavailable)
    }

    /// Returns the HTTP status code a routing layer should use for this kind.
    #[must_use]
    pub const fn http_status(self) -> u16 {
        match self {
            Self::DuplicateTransaction | Self::PlanAlreadyActive => 409,
            Self::UserNotFound => 404,
            Self::PaymentVerificationFailed => 401,
            Self::AmountMismatch
            | Self::InvalidPlan
            | Self::InvalidRequest
            | Self::NoActivePlan
            | Self::DowngradeNotSupported
            | Self::RenewalNotAllowed => 400,
            Self::StorageUnavailable => 503,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
