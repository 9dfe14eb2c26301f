//! HMAC-SHA256 payment confirmation signatures.

use std::fmt;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, instrument};

use crate::security::redact_identifier;

type HmacSha256 = Hmac<Sha256>;

/// Length in bytes of an HMAC-SHA256 tag.
const TAG_LEN: usize = 32;

/// Gateway shared secret. Never printed.
#[derive(Clone)]
struct GatewaySecret(Vec<u8>);

impl fmt::Debug for GatewaySecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("GatewaySecret([REDACTED])")
    }
}

impl GatewaySecret {
    fn mac(&self) -> Option<HmacSha256> {
        if self.0.is_empty() {
            return None;
        }
        HmacSha256::new_from_slice(&self.0).ok()
    }
}

/// Builds the signed payload for an order/payment pair.
fn signed_payload(order_id: &str, payment_id: &str) -> String {
    format!("{order_id}|{payment_id}")
}

/// Verifies payment confirmations forwarded by the client.
///
/// The gateway signs `order_id + "|" + payment_id` with HMAC-SHA256 under the
/// shared secret and hex-encodes the tag. Every check returns a plain `bool`:
/// malformed input is simply "not verified".
///
/// # Examples
///
/// ```
/// use plan_reconciler::payment::{PaymentSigner, PaymentVerifier};
///
/// let signer = PaymentSigner::new(b"gateway-secret".to_vec());
/// let verifier = PaymentVerifier::new(b"gateway-secret".to_vec());
///
/// let signature = signer.sign("order_1", "pay_1");
/// assert!(verifier.verify("order_1", "pay_1", &signature));
/// assert!(!verifier.verify("order_1", "pay_2", &signature));
/// ```
#[derive(Debug, Clone)]
pub struct PaymentVerifier {
    secret: GatewaySecret,
}

impl PaymentVerifier {
    /// Creates a verifier for the given shared secret.
    ///
    /// An empty secret is accepted but rejects every signature.
    #[must_use]
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self { secret: GatewaySecret(secret.into()) }
    }

    /// Checks a payment confirmation signature in constant time.
    ///
    /// The signature must be exactly the 64 lowercase hex characters the
    /// gateway emits. Returns `false` on mismatch, empty ids, any other
    /// encoding (uppercase, surrounding whitespace, wrong length), and when
    /// the verifier holds an empty secret.
    #[must_use]
    #[instrument(
        skip(self, order_id, payment_id, signature),
        fields(order_id = %redact_identifier(order_id), payment_id = %redact_identifier(payment_id))
    )]
    pub fn verify(&self, order_id: &str, payment_id: &str, signature: &str) -> bool {
        if order_id.is_empty() || payment_id.is_empty() {
            debug!("Empty order or payment id");
            return false;
        }
        self.verify_bytes(signed_payload(order_id, payment_id).as_bytes(), signature)
    }

    /// Checks a signature over a raw webhook body.
    ///
    /// Same secret and encoding as [`verify`](Self::verify); the body must be
    /// the exact bytes received.
    #[must_use]
    #[instrument(skip_all, fields(body_len = body.len()))]
    pub fn verify_webhook(&self, body: &[u8], signature: &str) -> bool {
        self.verify_bytes(body, signature)
    }

    fn verify_bytes(&self, payload: &[u8], signature: &str) -> bool {
        if signature.len() != TAG_LEN * 2 {
            debug!(len = signature.len(), "Signature has wrong length");
            return false;
        }
        if !signature.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            debug!("Signature is not lowercase hex");
            return false;
        }
        let Some(mut mac) = self.secret.mac() else {
            debug!("No gateway secret configured");
            return false;
        };
        mac.update(payload);
        let expected = hex::encode(mac.finalize().into_bytes());

        expected.as_bytes().ct_eq(signature.as_bytes()).into()
    }
}

/// Produces gateway-format signatures.
///
/// Used to simulate the gateway in tests, benchmarks and local tooling.
#[derive(Debug, Clone)]
pub struct PaymentSigner {
    secret: GatewaySecret,
}

impl PaymentSigner {
    /// Creates a signer for the given shared secret.
    #[must_use]
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self { secret: GatewaySecret(secret.into()) }
    }

    /// Signs an order/payment pair, returning lowercase hex.
    ///
    /// Returns an empty string when the secret is empty; no verifier accepts it.
    #[must_use]
    pub fn sign(&self, order_id: &str, payment_id: &str) -> String {
        self.sign_bytes(signed_payload(order_id, payment_id).as_bytes())
    }

    /// Signs a raw webhook body, returning lowercase hex.
    #[must_use]
    pub fn sign_webhook(&self, body: &[u8]) -> String {
        self.sign_bytes(body)
    }

    fn sign_bytes(&self, payload: &[u8]) -> String {
        let Some(mut mac) = self.secret.mac() else {
            return String::new();
        };
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }
}

/// Four-argument form of [`PaymentVerifier::verify`].
///
/// # Examples
///
/// ```
/// use plan_reconciler::payment::{PaymentSigner, verify_payment};
///
/// let sig = PaymentSigner::new(b"s3cret".to_vec()).sign("order_9", "pay_9");
/// assert!(verify_payment("order_9", "pay_9", &sig, b"s3cret"));
/// assert!(!verify_payment("order_9", "pay_9", &sig, b"other"));
/// ```
#[must_use]
pub fn verify_payment(order_id: &str, payment_id: &str, signature: &str, secret: &[u8]) -> bool {
    PaymentVerifier::new(secret).verify(order_id, payment_id, signature)
}
