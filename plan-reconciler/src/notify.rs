//! Invoice notification collaborator.
//!
//! Delivery happens after the commit, detached from the reconcile call. A
//! failed or slow notification is logged and never changes the result the
//! caller sees.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::{
    catalog::{Money, PlanTitle},
    entitlement::{OrderId, Subscription, SubscriptionId, TransactionId, UserId},
    reconcile::Action,
    reliability::{RetryPolicy, retry_with_backoff},
    security::redact_identifier,
};

/// Everything an invoice needs, captured at commit time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceSnapshot {
    /// Billed user.
    pub user_id: UserId,
    /// Transition that was paid for.
    pub action: Action,
    /// Tier after the transition.
    pub plan_title: PlanTitle,
    /// Subscription record.
    pub subscription_id: SubscriptionId,
    /// Gateway payment id.
    pub transaction_id: TransactionId,
    /// Gateway order id.
    pub order_id: OrderId,
    /// Amount charged.
    pub amount_charged: Money,
    /// List price of the tier.
    pub original_price: Money,
    /// Term start.
    pub start_date: DateTime<Utc>,
    /// Term end.
    pub expiry_date: DateTime<Utc>,
}

impl InvoiceSnapshot {
    /// Captures the invoice for a committed subscription revision.
    #[must_use]
    pub fn from_subscription(action: Action, subscription: &Subscription) -> Self {
        Self {
            user_id: subscription.user_id.clone(),
            action,
            plan_title: subscription.plan_title,
            subscription_id: subscription.id.clone(),
            transaction_id: subscription.transaction_id.clone(),
            order_id: subscription.order_id.clone(),
            amount_charged: subscription.price_paid,
            original_price: subscription.original_price,
            start_date: subscription.start_date,
            expiry_date: subscription.expiry_date,
        }
    }
}

/// Invoice delivery failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotifyError {
    /// The dispatcher rejected or failed the message.
    #[error("invoice delivery failed: {0}")]
    Delivery(String),
    /// Delivery did not finish within the notification timeout.
    #[error("invoice delivery timed out")]
    Timeout,
}

/// Sends invoices for committed subscription changes.
pub trait InvoiceNotifier: Send + Sync + 'static {
    /// Delivers one invoice to `email`.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError::Delivery`] when the message could not be sent.
    fn send_invoice<'a>(
        &'a self,
        email: &'a str,
        invoice: &'a InvoiceSnapshot,
    ) -> impl Future<Output = Result<(), NotifyError>> + Send + 'a;
}

/// Writes invoices to the `invoice` tracing target.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl InvoiceNotifier for LogNotifier {
    async fn send_invoice<'a>(
        &'a self,
        _email: &'a str,
        invoice: &'a InvoiceSnapshot,
    ) -> Result<(), NotifyError> {
        info!(
            target: "invoice",
            user_id = %redact_identifier(invoice.user_id.as_str()),
            action = %invoice.action,
            plan_title = %invoice.plan_title,
            amount = invoice.amount_charged.minor(),
            expiry = %invoice.expiry_date,
            "Invoice issued"
        );
        Ok(())
    }
}

/// Discards invoices.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl InvoiceNotifier for NoopNotifier {
    async fn send_invoice<'a>(
        &'a self,
        _email: &'a str,
        _invoice: &'a InvoiceSnapshot,
    ) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Spawns invoice delivery on its own task.
///
/// Each attempt is bounded by `timeout`; failed attempts are retried per
/// `policy`. The final failure is logged and dropped.
pub(crate) fn dispatch_invoice<N: InvoiceNotifier>(
    notifier: Arc<N>,
    email: String,
    invoice: InvoiceSnapshot,
    timeout: Duration,
    policy: RetryPolicy,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = retry_with_backoff(&policy, |_| true, || {
            let notifier = Arc::clone(&notifier);
            let email = email.as_str();
            let invoice = &invoice;
            async move {
                tokio::time::timeout(timeout, notifier.send_invoice(email, invoice))
                    .await
                    .map_err(|_| NotifyError::Timeout)?
            }
        })
        .await;

        if let Err(e) = result {
            error!(
                error = %e,
                user_id = %redact_identifier(invoice.user_id.as_str()),
                transaction_id = %redact_identifier(invoice.transaction_id.as_str()),
                "Invoice notification failed"
            );
        }
    })
}
