//! Plan Reconciler: subscription lifecycle and payment reconciliation.
//!
//! Moves users between plan tiers (Free, Quarterly, Half-Yearly, Annual) once
//! a payment gateway confirms the charge. Every transition is verified,
//! priced, de-duplicated and committed atomically.
//!
//! # Architecture
//!
//! ```text
//!  signed confirmation
//!          │
//! ┌────────▼───────────────────────────────────────────┐
//! │              SubscriptionReconciler                │
//! │  ┌────────────────┐  ┌───────────────────────┐     │
//! │  │ PaymentVerifier│  │ ProrationCalculator   │     │
//! │  │ (HMAC-SHA256)  │  │ (PlanCatalog prices)  │     │
//! │  └────────────────┘  └───────────────────────┘     │
//! │         per-user lock + retry + idempotency        │
//! └────────┬───────────────────────────────┬───────────┘
//!          │ UnitOfWork (user + record)    │ detached
//! ┌────────▼────────┐             ┌────────▼────────┐
//! │EntitlementStore │             │ InvoiceNotifier │
//! └─────────────────┘             └─────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use plan_reconciler::{
//!     catalog::PlanCatalog,
//!     entitlement::{InMemoryEntitlementStore, UserAccount, UserId},
//!     notify::LogNotifier,
//!     payment::{PaymentSigner, PaymentVerifier},
//!     reconcile::{Action, ReconcileRequest, SubscriptionReconciler},
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> plan_reconciler::Result<()> {
//! let store = Arc::new(InMemoryEntitlementStore::new());
//! store.insert_user(UserAccount::new(UserId::new("user_42")?, "owner@example.com"));
//!
//! let reconciler = SubscriptionReconciler::new(
//!     Arc::new(PlanCatalog::standard()),
//!     Arc::clone(&store),
//!     Arc::new(LogNotifier),
//!     PaymentVerifier::new(b"gateway-secret".to_vec()),
//! );
//!
//! // The gateway signs order_id|payment_id with the shared secret.
//! let signature = PaymentSigner::new(b"gateway-secret".to_vec()).sign("order_7", "pay_7");
//!
//! let outcome = reconciler
//!     .try_reconcile(&ReconcileRequest {
//!         action: Action::Purchase,
//!         user_id: "user_42".to_owned(),
//!         target_plan_title: "Half-Yearly".to_owned(),
//!         order_id: "order_7".to_owned(),
//!         payment_id: "pay_7".to_owned(),
//!         signature,
//!         amount_paid: None,
//!     })
//!     .await?;
//!
//! assert_eq!(outcome.subscription.price_paid.minor(), 15_999);
//! # Ok(())
//! # }
//! ```
//!
//! # Module Organization
//!
//! - [`catalog`]: plan definitions, money and quota types
//! - [`proration`]: upgrade pricing
//! - [`payment`]: signature verification
//! - [`entitlement`]: storage seam and the in-memory store
//! - [`reconcile`]: the orchestrator and its request/result types
//! - [`notify`]: invoice delivery
//! - [`config`]: TOML configuration
//! - [`error`]: error types and the public error taxonomy
//! - [`reliability`]: retry with exponential backoff
//! - [`security`]: audit logging and redaction
//!
//! # Guarantees
//!
//! - A payment id is applied at most once, across retries and concurrent calls
//! - The user's counters and the subscription record change together or not at all
//! - Nothing is read or written before the signature verifies
//! - Upgrade prices are never negative
//! - Invoice delivery never affects the result

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod catalog;
pub mod config;
pub mod entitlement;
pub mod error;
pub mod notify;
pub mod payment;
pub mod proration;
pub mod reconcile;
pub mod reliability;
pub mod security;

pub use config::EngineConfig;
pub use error::{ErrorKind, ReconcileError, Result};
pub use reconcile::{ReconcileRequest, ReconcileResult, SubscriptionReconciler};
