//! The reconcile orchestrator.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{
    locks::UserLocks,
    request::{Action, ReconcileOutcome, ReconcileRequest, ReconcileResult},
    state::{PlanState, PlanStatus, UpgradePreview},
};
use crate::{
    audit,
    catalog::{Money, PlanCatalog, PlanDefinition, PlanTier},
    entitlement::{
        EntitlementStore, OrderId, PaymentRecord, StoreError, StoreResult, Subscription,
        TransactionId, UnitOfWork, UserAccount, UserId,
    },
    error::{ReconcileError, Result},
    notify::{InvoiceNotifier, InvoiceSnapshot, dispatch_invoice},
    payment::PaymentVerifier,
    proration::{ProrationCalculator, RoundingMode},
    reliability::{RetryPolicy, is_retryable, retry_with_backoff},
    security::{AuditEventType, redact_identifier},
};

/// Tunables for [`SubscriptionReconciler`].
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Days before expiry in which renewal is accepted. `None` accepts
    /// renewal at any point of a running term.
    pub renewal_window_days: Option<u32>,
    /// Rounding of the proration credit.
    pub rounding: RoundingMode,
    /// Largest accepted gap between the expected and gateway-confirmed amount.
    pub amount_tolerance: Money,
    /// Upper bound on every store call.
    pub store_timeout: Duration,
    /// Upper bound on one invoice delivery attempt.
    pub notification_timeout: Duration,
    /// Retry policy for the reconcile unit of work.
    pub retry: RetryPolicy,
    /// Retry policy for invoice delivery.
    pub notification_retry: RetryPolicy,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            renewal_window_days: Some(3),
            rounding: RoundingMode::HalfUp,
            amount_tolerance: Money::from_minor(100),
            store_timeout: Duration::from_secs(5),
            notification_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            notification_retry: RetryPolicy::default(),
        }
    }
}

/// Request fields after validation, with the target plan resolved.
struct Validated<'c> {
    action: Action,
    user_id: UserId,
    plan: &'c PlanDefinition,
    order_id: OrderId,
    transaction_id: TransactionId,
}

/// A unit of work ready to commit.
struct Staged {
    unit: UnitOfWork,
    outcome: ReconcileOutcome,
}

/// Applies verified payments to users and subscriptions.
///
/// One call to [`reconcile`](Self::reconcile) runs the whole pipeline:
///
/// 1. validate the request and resolve the target plan
/// 2. verify the payment signature
/// 3. reject a payment id that was already applied
/// 4. load the user and check the transition against [`PlanState`]
/// 5. compute the expected charge and compare it to the confirmed amount
/// 6. commit the user and subscription changes as one unit of work
/// 7. send the invoice on a detached task
///
/// Steps 3 to 6 run under a per-user lock and are retried together on
/// transient storage failures, so a retry re-checks idempotency first.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use plan_reconciler::{
///     catalog::PlanCatalog,
///     entitlement::{InMemoryEntitlementStore, UserAccount, UserId},
///     notify::NoopNotifier,
///     payment::{PaymentSigner, PaymentVerifier},
///     reconcile::{Action, ReconcileRequest, SubscriptionReconciler},
/// };
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = Arc::new(InMemoryEntitlementStore::new());
/// store.insert_user(UserAccount::new(UserId::new("user_1").unwrap(), "a@example.com"));
///
/// let reconciler = SubscriptionReconciler::new(
///     Arc::new(PlanCatalog::standard()),
///     Arc::clone(&store),
///     Arc::new(NoopNotifier),
///     PaymentVerifier::new(b"secret".to_vec()),
/// );
///
/// let signature = PaymentSigner::new(b"secret".to_vec()).sign("order_1", "pay_1");
/// let result = reconciler
///     .reconcile(&ReconcileRequest {
///         action: Action::Purchase,
///         user_id: "user_1".to_owned(),
///         target_plan_title: "Quarterly".to_owned(),
///         order_id: "order_1".to_owned(),
///         payment_id: "pay_1".to_owned(),
///         signature,
///         amount_paid: None,
///     })
///     .await;
///
/// assert!(result.success);
/// # }
/// ```
pub struct SubscriptionReconciler<S, N> {
    catalog: Arc<PlanCatalog>,
    store: Arc<S>,
    notifier: Arc<N>,
    verifier: PaymentVerifier,
    calculator: ProrationCalculator,
    settings: ReconcilerSettings,
    locks: UserLocks,
    /// Outcomes whose commit ended without a definite answer, keyed by payment id.
    pending: Mutex<HashMap<TransactionId, ReconcileOutcome>>,
}

impl<S, N> fmt::Debug for SubscriptionReconciler<S, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionReconciler")
            .field("catalog_version", &self.catalog.version())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl<S: EntitlementStore, N: InvoiceNotifier> SubscriptionReconciler<S, N> {
    /// Creates a reconciler with default settings.
    #[must_use]
    pub fn new(
        catalog: Arc<PlanCatalog>,
        store: Arc<S>,
        notifier: Arc<N>,
        verifier: PaymentVerifier,
    ) -> Self {
        let settings = ReconcilerSettings::default();
        Self {
            catalog,
            store,
            notifier,
            verifier,
            calculator: ProrationCalculator::new(settings.rounding),
            settings,
            locks: UserLocks::new(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Replaces the settings.
    #[must_use]
    pub fn with_settings(mut self, settings: ReconcilerSettings) -> Self {
        self.calculator = ProrationCalculator::new(settings.rounding);
        self.settings = settings;
        self
    }

    /// Settings in use.
    #[must_use]
    pub const fn settings(&self) -> &ReconcilerSettings {
        &self.settings
    }

    /// Catalog in use.
    #[must_use]
    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    /// Reconciles a payment confirmation and reports the outcome in wire form.
    ///
    /// Never fails: errors are folded into [`ReconcileResult::failure`].
    pub async fn reconcile(&self, request: &ReconcileRequest) -> ReconcileResult {
        match self.try_reconcile(request).await {
            Ok(outcome) => ReconcileResult::from(&outcome),
            Err(e) => ReconcileResult::failure(e.kind()),
        }
    }

    /// Reconciles a payment confirmation.
    ///
    /// # Errors
    ///
    /// Returns the [`ReconcileError`] of the first failing step. Transient
    /// storage failures are retried first and surface as
    /// [`ReconcileError::StorageUnavailable`] once retries run out.
    pub async fn try_reconcile(&self, request: &ReconcileRequest) -> Result<ReconcileOutcome> {
        let request_id = Uuid::new_v4();
        let started = Instant::now();
        let result = self.execute(request, request_id).await;

        match &result {
            Ok(outcome) => audit!(
                AuditEventType::SubscriptionReconciled,
                &request.user_id,
                request_id,
                with_action(request.action.as_str()),
                with_plan_title(outcome.subscription.plan_title.as_str()),
                with_payment_id(redact_identifier(&request.payment_id)),
                with_amount(outcome.subscription.price_paid.minor()),
                with_duration(started.elapsed()),
            ),
            Err(e) => {
                let event_type = match e {
                    ReconcileError::PaymentVerificationFailed { .. } => {
                        AuditEventType::PaymentVerificationFailed
                    }
                    ReconcileError::DuplicateTransaction(_) => AuditEventType::DuplicateTransaction,
                    ReconcileError::AmountMismatch { .. } => AuditEventType::AmountMismatch,
                    _ => AuditEventType::ReconcileFailed,
                };
                audit!(
                    event_type,
                    &request.user_id,
                    request_id,
                    with_action(request.action.as_str()),
                    with_plan_title(request.target_plan_title.as_str()),
                    with_payment_id(redact_identifier(&request.payment_id)),
                    with_error(e.to_string()),
                    with_duration(started.elapsed()),
                );
            }
        }
        result
    }

    #[instrument(
        skip(self, request, request_id),
        fields(
            action = %request.action,
            user_id = %redact_identifier(&request.user_id),
            plan = %request.target_plan_title,
            request_id = %request_id
        )
    )]
    async fn execute(
        &self,
        request: &ReconcileRequest,
        request_id: Uuid,
    ) -> Result<ReconcileOutcome> {
        let validated = self.validate(request)?;

        if !self.verifier.verify(&request.order_id, &request.payment_id, &request.signature) {
            return Err(ReconcileError::PaymentVerificationFailed {
                order_id: request.order_id.clone(),
            });
        }
        audit!(
            AuditEventType::PaymentVerified,
            &request.user_id,
            request_id,
            with_order_id(redact_identifier(&request.order_id)),
            with_payment_id(redact_identifier(&request.payment_id)),
        );

        let outcome = {
            let _guard = self.locks.acquire(&validated.user_id).await;
            let result = retry_with_backoff(&self.settings.retry, is_retryable, || {
                self.attempt(&validated, request.amount_paid)
            })
            .await;
            self.take_pending(&validated.transaction_id);
            result?
        };

        info!(
            subscription_id = %outcome.subscription.id,
            revision = outcome.subscription.revision,
            price = outcome.subscription.price_paid.minor(),
            "Subscription reconciled"
        );

        drop(dispatch_invoice(
            Arc::clone(&self.notifier),
            outcome.user.email.clone(),
            InvoiceSnapshot::from_subscription(outcome.action, &outcome.subscription),
            self.settings.notification_timeout,
            self.settings.notification_retry.clone(),
        ));

        Ok(outcome)
    }

    /// Prices an upgrade without verifying a payment or changing anything.
    ///
    /// # Errors
    ///
    /// - [`ReconcileError::InvalidRequest`] / [`ReconcileError::InvalidPlan`] on bad input
    /// - [`ReconcileError::UserNotFound`] if the user does not exist
    /// - [`ReconcileError::NoActivePlan`] if the user holds no subscription
    /// - [`ReconcileError::DowngradeNotSupported`] if the target does not rank higher
    /// - [`ReconcileError::StorageUnavailable`] if the store cannot be read
    #[instrument(skip(self, user_id), fields(user_id = %redact_identifier(user_id)))]
    pub async fn preview_upgrade(
        &self,
        user_id: &str,
        target_plan_title: &str,
    ) -> Result<UpgradePreview> {
        let user_id = UserId::new(user_id)?;
        let target = self.catalog.lookup_str(target_plan_title)?;
        let (user, subscription) =
            retry_with_backoff(&self.settings.retry, is_retryable, || self.load_account(&user_id))
                .await?;
        let subscription =
            subscription.ok_or_else(|| ReconcileError::NoActivePlan(user_id.to_string()))?;
        let current = self.upgrade_source(&subscription, target)?;

        let quote = self.calculator.quote(&subscription.billing_period(), target, Utc::now());
        Ok(UpgradePreview {
            current_plan: user.current_plan,
            target_plan: PlanTier::Paid(target.title),
            quote,
            quota_delta: target.quotas.delta_from(current.quotas),
        })
    }

    /// Reports where a user stands in the plan lifecycle.
    ///
    /// # Errors
    ///
    /// [`ReconcileError::InvalidRequest`], [`ReconcileError::UserNotFound`] or
    /// [`ReconcileError::StorageUnavailable`].
    #[instrument(skip(self, user_id), fields(user_id = %redact_identifier(user_id)))]
    pub async fn plan_state(&self, user_id: &str) -> Result<PlanStatus> {
        let user_id = UserId::new(user_id)?;
        let (user, subscription) =
            retry_with_backoff(&self.settings.retry, is_retryable, || self.load_account(&user_id))
                .await?;
        Ok(PlanStatus::new(
            &user,
            subscription.as_ref(),
            Utc::now(),
            self.settings.renewal_window_days,
        ))
    }

    fn validate(&self, request: &ReconcileRequest) -> Result<Validated<'_>> {
        let user_id = UserId::new(request.user_id.as_str())?;
        let order_id = OrderId::new(request.order_id.as_str())?;
        let transaction_id = TransactionId::new(request.payment_id.as_str())?;
        if request.signature.trim().is_empty() {
            return Err(ReconcileError::InvalidRequest("signature cannot be empty".to_owned()));
        }
        let plan = self.catalog.lookup_str(&request.target_plan_title)?;
        Ok(Validated { action: request.action, user_id, plan, order_id, transaction_id })
    }

    /// Steps 3 to 6 for one attempt.
    async fn attempt(
        &self,
        request: &Validated<'_>,
        amount_paid: Option<Money>,
    ) -> Result<ReconcileOutcome> {
        if let Some(existing) = self
            .store_call(self.store.find_subscription_by_transaction_id(&request.transaction_id))
            .await?
        {
            if existing.user_id == request.user_id
                && existing.order_id == request.order_id
                && let Some(outcome) = self.recover_pending(&request.transaction_id).await?
            {
                return Ok(outcome);
            }
            return Err(ReconcileError::DuplicateTransaction(request.transaction_id.to_string()));
        }

        let (user, subscription) = self.load_account(&request.user_id).await?;
        let staged = self.stage(request, user, subscription, amount_paid, Utc::now())?;
        self.commit(staged).await
    }

    /// Checks the transition and builds the unit of work.
    fn stage(
        &self,
        request: &Validated<'_>,
        mut user: UserAccount,
        current: Option<Subscription>,
        amount_paid: Option<Money>,
        now: DateTime<Utc>,
    ) -> Result<Staged> {
        let plan = request.plan;
        let state = PlanState::classify(current.as_ref(), now, self.settings.renewal_window_days);
        debug!(state = ?state, "Classified plan state");

        let (expected_price, quote, quota_delta) = match request.action {
            Action::Purchase => {
                if !state.allows_purchase(current.as_ref(), plan.title) {
                    return Err(ReconcileError::PlanAlreadyActive(user.id.to_string()));
                }
                (plan.price, None, plan.quotas)
            }
            Action::Renew => {
                let subscription = current
                    .as_ref()
                    .ok_or_else(|| ReconcileError::NoActivePlan(user.id.to_string()))?;
                if subscription.plan_title != plan.title {
                    return Err(ReconcileError::RenewalNotAllowed(format!(
                        "current plan is {}, not {}",
                        subscription.plan_title, plan.title
                    )));
                }
                let window = self.settings.renewal_window_days;
                if !state.allows_renewal(window.is_some()) {
                    return Err(ReconcileError::RenewalNotAllowed(match (state, window) {
                        (PlanState::Lapsed, _) => "plan has lapsed; purchase instead".to_owned(),
                        (_, Some(days)) => format!(
                            "{} days to expiry, window opens at {days}",
                            subscription.days_until_expiry(now)
                        ),
                        _ => format!("plan state {state:?}"),
                    }));
                }
                (plan.price, None, plan.quotas)
            }
            Action::Upgrade => {
                let subscription = current
                    .as_ref()
                    .ok_or_else(|| ReconcileError::NoActivePlan(user.id.to_string()))?;
                self.upgrade_source(subscription, plan)?;
                let quote = self.calculator.quote(&subscription.billing_period(), plan, now);
                (quote.price, Some(quote), plan.quotas.delta_from(subscription.quotas))
            }
        };

        let price_paid = self.check_amount(expected_price, amount_paid)?;
        let payment = PaymentRecord {
            transaction_id: request.transaction_id.clone(),
            order_id: request.order_id.clone(),
            price_paid,
            expected_price,
        };

        let subscription = match (request.action, current.as_ref()) {
            (Action::Renew | Action::Upgrade, Some(existing)) => {
                existing.next_revision(plan, payment, now)?
            }
            _ => Subscription::open(user.id.clone(), plan, payment, now)?,
        };

        user.current_plan = PlanTier::Paid(plan.title);
        user.active_plan_id = Some(subscription.id.clone());
        user.quotas = user.quotas.apply_delta(quota_delta);

        let outcome = ReconcileOutcome {
            action: request.action,
            subscription: subscription.clone(),
            user: user.clone(),
            expected_price,
            quote,
            quota_delta,
        };
        Ok(Staged { unit: UnitOfWork::new(user, subscription), outcome })
    }

    /// Resolves the plan being upgraded from and checks the target ranks above it.
    fn upgrade_source(
        &self,
        subscription: &Subscription,
        target: &PlanDefinition,
    ) -> Result<&PlanDefinition> {
        let current = self.catalog.lookup(subscription.plan_title)?;
        if target.order <= current.order {
            return Err(ReconcileError::DowngradeNotSupported {
                current: current.title.to_string(),
                target: target.title.to_string(),
            });
        }
        Ok(current)
    }

    /// Returns the amount to record as paid.
    fn check_amount(&self, expected: Money, confirmed: Option<Money>) -> Result<Money> {
        let Some(confirmed) = confirmed else {
            return Ok(expected);
        };
        let gap = expected.abs_diff(confirmed);
        if gap == 0 {
            return Ok(confirmed);
        }
        if gap > self.settings.amount_tolerance.minor().unsigned_abs() {
            return Err(ReconcileError::AmountMismatch {
                expected: expected.minor(),
                confirmed: confirmed.minor(),
            });
        }
        warn!(
            expected = expected.minor(),
            confirmed = confirmed.minor(),
            "Confirmed amount differs from expected price within tolerance"
        );
        Ok(confirmed)
    }

    async fn load_account(&self, user_id: &UserId) -> Result<(UserAccount, Option<Subscription>)> {
        let user = self
            .store_call(self.store.get_user_by_id(user_id))
            .await?
            .ok_or_else(|| ReconcileError::UserNotFound(user_id.to_string()))?;
        let subscription = self.store_call(self.store.get_active_subscription(user_id)).await?;
        Ok((user, subscription))
    }

    async fn store_call<T>(&self, call: impl Future<Output = StoreResult<T>>) -> Result<T> {
        match tokio::time::timeout(self.settings.store_timeout, call).await {
            Ok(result) => result.map_err(ReconcileError::StorageUnavailable),
            Err(_) => Err(ReconcileError::StorageUnavailable(StoreError::Timeout)),
        }
    }

    /// Runs the commit on its own task so dropping the caller cannot cut it short.
    async fn commit(&self, staged: Staged) -> Result<ReconcileOutcome> {
        let Staged { unit, outcome } = staged;
        let store = Arc::clone(&self.store);
        let timeout = self.settings.store_timeout;
        let task = tokio::spawn(async move {
            tokio::time::timeout(timeout, store.run_atomic(unit)).await
        });

        match task.await {
            Ok(Ok(Ok(()))) => Ok(outcome),
            Ok(Ok(Err(StoreError::DuplicateTransaction(transaction_id)))) => {
                Err(ReconcileError::DuplicateTransaction(transaction_id))
            }
            Ok(Ok(Err(e))) => Err(ReconcileError::StorageUnavailable(e)),
            Ok(Err(_)) => {
                warn!("Commit outcome unknown after timeout");
                self.remember_pending(outcome);
                Err(ReconcileError::StorageUnavailable(StoreError::Timeout))
            }
            Err(join_error) => {
                warn!(error = %join_error, "Commit task did not complete");
                self.remember_pending(outcome);
                Err(ReconcileError::StorageUnavailable(StoreError::Unavailable(
                    "commit task aborted".to_owned(),
                )))
            }
        }
    }

    fn remember_pending(&self, outcome: ReconcileOutcome) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(outcome.subscription.transaction_id.clone(), outcome);
    }

    fn take_pending(&self, transaction_id: &TransactionId) -> Option<ReconcileOutcome> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).remove(transaction_id)
    }

    /// Completes an attempt whose commit landed even though it reported a timeout.
    async fn recover_pending(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<Option<ReconcileOutcome>> {
        let Some(mut outcome) = self.take_pending(transaction_id) else {
            return Ok(None);
        };
        info!("Recovered commit that reported a timeout");
        if let Some(user) = self.store_call(self.store.get_user_by_id(&outcome.user.id)).await? {
            outcome.user = user;
        }
        Ok(Some(outcome))
    }
}
