//! Audit logging for payment and entitlement events.
//!
//! Every reconcile attempt leaves one audit trail keyed by a correlation id.
//! Identifiers are partially redacted and free-form error text is scrubbed
//! before anything is emitted.

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Types of auditable events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// Payment confirmation signature verified.
    PaymentVerified,
    /// Payment confirmation signature rejected. Possible forgery.
    PaymentVerificationFailed,
    /// A payment id was presented again after being applied.
    DuplicateTransaction,
    /// Gateway-confirmed amount diverged from the expected price.
    AmountMismatch,
    /// User and subscription were updated.
    SubscriptionReconciled,
    /// Reconciliation failed after verification.
    ReconcileFailed,
}

/// Details for an audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuditDetails {
    /// Requested action.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Target plan title.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_title: Option<String>,
    /// Gateway order id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    /// Gateway payment id (partially redacted).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,
    /// Amount charged or expected, in minor units.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<i64>,
    /// Error message (sensitive data redacted).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Duration of the operation in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Audit log entry.
///
/// # Examples
///
/// ```
/// use plan_reconciler::security::audit::{AuditEvent, AuditEventType, redact_identifier};
/// use uuid::Uuid;
///
/// let event = AuditEvent::new(AuditEventType::PaymentVerified, "user_64f1a2b3", Uuid::new_v4())
///     .with_order_id("order_Nq8x")
///     .with_payment_id(redact_identifier("pay_29QQoUBi66xm2f"));
///
/// plan_reconciler::security::audit::audit_log(&event);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred.
    pub timestamp: SystemTime,
    /// What happened.
    pub event_type: AuditEventType,
    /// Affected user (partially redacted).
    pub user_id: String,
    /// Correlation id of the reconcile call.
    pub request_id: Uuid,
    /// Contextual information.
    pub details: AuditDetails,
}

impl AuditEvent {
    /// Creates a new audit event. `user_id` is redacted on the way in.
    #[must_use]
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl AsRef<str> is idiomatic for builder methods"
    )]
    pub fn new(event_type: AuditEventType, user_id: impl AsRef<str>, request_id: Uuid) -> Self {
        Self {
            timestamp: SystemTime::now(),
            event_type,
            user_id: redact_identifier(user_id.as_ref()),
            request_id,
            details: AuditDetails::default(),
        }
    }

    /// Adds the requested action.
    #[must_use]
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<String> is idiomatic for builder methods"
    )]
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.details.action = Some(action.into());
        self
    }

    /// Adds the target plan title.
    #[must_use]
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<String> is idiomatic for builder methods"
    )]
    pub fn with_plan_title(mut self, title: impl Into<String>) -> Self {
        self.details.plan_title = Some(title.into());
        self
    }

    /// Adds the gateway order id.
    #[must_use]
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<String> is idiomatic for builder methods"
    )]
    pub fn with_order_id(mut self, order_id: impl Into<String>) -> Self {
        self.details.order_id = Some(order_id.into());
        self
    }

    /// Adds the gateway payment id.
    ///
    /// Callers should pass it through [`redact_identifier`] first.
    #[must_use]
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<String> is idiomatic for builder methods"
    )]
    pub fn with_payment_id(mut self, payment_id: impl Into<String>) -> Self {
        self.details.payment_id = Some(payment_id.into());
        self
    }

    /// Adds an amount in minor units.
    #[must_use]
    pub const fn with_amount(mut self, amount: i64) -> Self {
        self.details.amount = Some(amount);
        self
    }

    /// Adds an error message, scrubbed by [`redact_sensitive`].
    #[must_use]
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<String> is idiomatic for builder methods"
    )]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.details.error = Some(redact_sensitive(&error.into()));
        self
    }

    /// Adds the operation duration.
    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.details.duration_ms = Some(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX));
        self
    }
}

/// Logs an audit event to tracing with target `"audit"`.
///
/// Verification failures are emitted at `WARN` so they surface in default
/// filters; everything else at `INFO`.
pub fn audit_log(event: &AuditEvent) {
    match event.event_type {
        AuditEventType::PaymentVerificationFailed | AuditEventType::AmountMismatch => {
            tracing::warn!(
                target: "audit",
                timestamp = ?event.timestamp,
                event_type = ?event.event_type,
                user_id = %event.user_id,
                request_id = %event.request_id,
                details = ?event.details,
                "AUDIT"
            );
        }
        _ => {
            tracing::info!(
                target: "audit",
                timestamp = ?event.timestamp,
                event_type = ?event.event_type,
                user_id = %event.user_id,
                request_id = %event.request_id,
                details = ?event.details,
                "AUDIT"
            );
        }
    }
}

/// Minimum run of hex digits treated as key material.
const MIN_SECRET_HEX_RUN: usize = 32;

/// Redacts sensitive data from free-form text.
///
/// Text is scanned word by word (alphanumerics plus `@ . _ - +`):
/// - runs of 32+ hex digits (signatures, keys, tokens) become `[REDACTED]`
/// - 13 to 19 digits, optionally dash-separated (card numbers), become `[REDACTED]`
/// - email local parts are masked, keeping the first character and domain
///
/// # Examples
///
/// ```
/// use plan_reconciler::security::audit::redact_sensitive;
///
/// let sig = "a".repeat(64);
/// let redacted = redact_sensitive(&format!("bad signature {sig} from jane@example.com"));
/// assert_eq!(redacted, "bad signature [REDACTED] from j***@example.com");
///
/// // short hex runs are not treated as secrets
/// assert_eq!(redact_sensitive("signature=deadbeef"), "signature=deadbeef");
/// ```
#[must_use]
pub fn redact_sensitive(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut word = String::new();
    for c in input.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '_' | '-' | '+') {
            word.push(c);
        } else {
            flush_word(&mut out, &mut word);
            out.push(c);
        }
    }
    flush_word(&mut out, &mut word);
    out
}

fn flush_word(out: &mut String, word: &mut String) {
    if !word.is_empty() {
        out.push_str(&redact_word(word));
        word.clear();
    }
}

fn redact_word(word: &str) -> String {
    let core = word.trim_matches(|c| matches!(c, '.' | '_' | '-' | '+'));
    if core.is_empty() {
        return word.to_owned();
    }

    if let Some((local, domain)) = core.split_once('@')
        && !local.is_empty()
        && domain.contains('.')
    {
        let first = local.chars().next().map(String::from).unwrap_or_default();
        return word.replacen(core, &format!("{first}***@{domain}"), 1);
    }

    let digits = core.chars().filter(char::is_ascii_digit).count();
    let is_hex_secret =
        core.len() >= MIN_SECRET_HEX_RUN && core.chars().all(|c| c.is_ascii_hexdigit());
    let is_card = core.chars().all(|c| c.is_ascii_digit() || c == '-')
        && (13..=19).contains(&digits);
    if is_hex_secret || is_card {
        return word.replacen(core, "[REDACTED]", 1);
    }

    word.to_owned()
}

/// Redacts an identifier to its prefix and last 4 characters.
///
/// The prefix is everything up to and including the first `_` or `-`, kept
/// only when it ends before the visible tail.
///
/// # Examples
///
/// ```
/// use plan_reconciler::security::audit::redact_identifier;
///
/// assert_eq!(redact_identifier("pay_29QQoUBi66xm2f"), "pay_**********xm2f");
/// assert_eq!(redact_identifier("64f1a2b3c4d5"), "********c4d5");
/// assert_eq!(redact_identifier("abc"), "abc");
/// ```
#[must_use]
pub fn redact_identifier(id: &str) -> String {
    let chars: Vec<char> = id.chars().collect();
    if chars.len() <= 4 {
        return id.to_owned();
    }

    let visible_start = chars.len() - 4;
    let prefix_len = chars
        .iter()
        .position(|c| *c == '_' || *c == '-')
        .map(|pos| pos + 1)
        .filter(|len| *len <= visible_start)
        .unwrap_or(0);

    let prefix: String = chars[..prefix_len].iter().collect();
    let tail: String = chars[visible_start..].iter().collect();
    format!("{prefix}{}{tail}", "*".repeat(visible_start - prefix_len))
}

/// Convenience macro for audit logging.
///
/// # Examples
///
/// ```
/// use plan_reconciler::{audit, security::audit::AuditEventType};
/// use uuid::Uuid;
///
/// audit!(AuditEventType::PaymentVerified, "user_1", Uuid::new_v4());
///
/// audit!(
///     AuditEventType::SubscriptionReconciled,
///     "user_1",
///     Uuid::new_v4(),
///     with_action("upgrade"),
///     with_amount(25_488)
/// );
/// ```
#[macro_export]
macro_rules! audit {
    ($event_type:expr, $user_id:expr, $request_id:expr) => {
        $crate::security::audit::audit_log(
            &$crate::security::audit::AuditEvent::new($event_type, $user_id, $request_id)
        )
    };
    ($event_type:expr, $user_id:expr, $request_id:expr, $($method:ident($arg:expr)),+ $(,)?) => {
        $crate::security::audit::audit_log(
            &$crate::security::audit::AuditEvent::new($event_type, $user_id, $request_id)
                $(.$method($arg))+
        )
    };
}

#[cfg(test)]
#[allow(
    clippy::str_to_string,
    reason = "test code uses this pattern for readability"
)]
mod tests {
    use super::*;

    // ========================================================================
    // Redaction Tests
    // ========================================================================

    #[test]
    fn test_redact_signature_hex() {
        let sig = "0123456789abcdef".repeat(4);
        let redacted = redact_sensitive(&format!("signature={sig} rejected"));
        assert!(!redacted.contains(&sig));
        assert!(redacted.contains("[REDACTED]"));
    }

    #[test]
    fn test_redact_card_number() {
        assert_eq!(redact_sensitive("card 4111111111111111."), "card [REDACTED].");
    }

    #[test]
    fn test_redact_dashed_card_number() {
        assert_eq!(redact_sensitive("card: 4111-1111-1111-1111"), "card: [REDACTED]");
    }

    #[test]
    fn test_short_numbers_kept() {
        assert_eq!(redact_sensitive("expected 25488, got 8999"), "expected 25488, got 8999");
    }

    #[test]
    fn test_redact_email() {
        assert_eq!(
            redact_sensitive("invoice to priya@example.in failed"),
            "invoice to p***@example.in failed"
        );
    }

    #[test]
    fn test_redact_preserves_whitespace() {
        assert_eq!(redact_sensitive("a  b\tc\n"), "a  b\tc\n");
        assert_eq!(redact_sensitive(""), "");
    }

    #[test]
    fn test_redact_identifier() {
        assert_eq!(redact_identifier("user-1234567890"), "user-******7890");
        assert_eq!(redact_identifier("order_ab"), "****r_ab");
        assert_eq!(redact_identifier("abcd"), "abcd");
        assert_eq!(redact_identifier(""), "");
    }

    #[test]
    fn test_redact_identifier_long_prefix_dropped() {
        assert_eq!(redact_identifier("abcdefgh_"), "*****fgh_");
    }

    // ========================================================================
    // Event Tests
    // ========================================================================

    #[test]
    fn test_event_builder() {
        let event = AuditEvent::new(AuditEventType::AmountMismatch, "user_987654321", Uuid::nil())
            .with_action("upgrade")
            .with_plan_title("Annual")
            .with_amount(25_488)
            .with_duration(Duration::from_millis(12))
            .with_error("gateway reported card 4111111111111111");

        assert_eq!(event.user_id, "user_****4321");
        assert_eq!(event.details.action.as_deref(), Some("upgrade"));
        assert_eq!(event.details.amount, Some(25_488));
        assert_eq!(event.details.duration_ms, Some(12));
        assert_eq!(event.details.error.as_deref(), Some("gateway reported card [REDACTED]"));
    }

    #[test]
    fn test_event_type_serialization() {
        let json = serde_json::to_string(&AuditEventType::PaymentVerificationFailed).unwrap();
        assert_eq!(json, "\"payment_verification_failed\"");
    }

    #[test]
    fn test_details_skip_empty_fields() {
        let json = serde_json::to_string(&AuditDetails::default()).unwrap();
        assert_eq!(json, "{}");
    }

    #[test]
    fn test_audit_macro_compiles() {
        audit!(AuditEventType::ReconcileFailed, "user_1", Uuid::nil(), with_error("store down"));
    }
}
