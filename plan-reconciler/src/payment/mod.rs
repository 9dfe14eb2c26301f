//! Payment authenticity checks.
//!
//! The client forwards the gateway's confirmation `(order_id, payment_id,
//! signature)`; nothing is trusted until [`PaymentVerifier::verify`] accepts
//! it. Verification is pure and synchronous and runs before any lock is
//! taken.

mod verifier;

pub use verifier::{PaymentSigner, PaymentVerifier, verify_payment};
