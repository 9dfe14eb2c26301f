//! Security controls for reconciliation.
//!
//! # Audit Logging
//!
//! Payment verification outcomes, duplicate payments, amount mismatches and
//! committed changes are emitted as structured events on the `audit` tracing
//! target, with identifiers partially redacted:
//!
//! ```rust
//! use plan_reconciler::security::audit::{AuditEvent, AuditEventType};
//! use uuid::Uuid;
//!
//! let event = AuditEvent::new(AuditEventType::SubscriptionReconciled, "user_456", Uuid::new_v4())
//!     .with_action("purchase")
//!     .with_plan_title("Quarterly")
//!     .with_amount(8_999);
//!
//! plan_reconciler::security::audit::audit_log(&event);
//! ```
//!
//! # Security Considerations
//!
//! - Signature comparison is constant time (see [`crate::payment`])
//! - The gateway secret is never logged; its `Debug` output is redacted
//! - Audit logs use a separate tracing target for easy routing
//! - Signatures, card numbers and email addresses are scrubbed from error text

pub mod audit;

pub use audit::{
    AuditDetails, AuditEvent, AuditEventType, audit_log, redact_identifier, redact_sensitive,
};
