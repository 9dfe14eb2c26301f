//! End-to-end reconciliation scenarios against the in-memory store.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use plan_reconciler::{
    EngineConfig, ErrorKind,
    catalog::{Money, PlanCatalog, PlanDefinition, PlanTier, PlanTitle, Quotas},
    entitlement::{
        FailPoint, InMemoryEntitlementStore, OrderId, PaymentRecord, Subscription, TransactionId,
        UserAccount, UserId, term_end,
    },
    notify::{InvoiceNotifier, InvoiceSnapshot, NoopNotifier, NotifyError},
    payment::{PaymentSigner, PaymentVerifier},
    reconcile::{Action, PlanState, ReconcileRequest, ReconcilerSettings, SubscriptionReconciler},
    reliability::RetryPolicy,
};

const SECRET: &[u8] = b"whsec_test_gateway_secret";
const USER: &str = "user_64f1a2b3";

// ============================================================================
// Fixtures
// ============================================================================

fn fast_settings() -> ReconcilerSettings {
    ReconcilerSettings {
        retry: RetryPolicy { initial_delay: Duration::from_millis(1), ..RetryPolicy::default() },
        notification_retry: RetryPolicy {
            initial_delay: Duration::from_millis(1),
            ..RetryPolicy::default()
        },
        ..ReconcilerSettings::default()
    }
}

fn build<N: InvoiceNotifier>(
    catalog: PlanCatalog,
    store: &Arc<InMemoryEntitlementStore>,
    notifier: Arc<N>,
    settings: ReconcilerSettings,
) -> SubscriptionReconciler<InMemoryEntitlementStore, N> {
    SubscriptionReconciler::new(
        Arc::new(catalog),
        Arc::clone(store),
        notifier,
        PaymentVerifier::new(SECRET.to_vec()),
    )
    .with_settings(settings)
}

fn store_with_user(quotas: Quotas) -> Arc<InMemoryEntitlementStore> {
    let store = Arc::new(InMemoryEntitlementStore::new());
    let mut user = UserAccount::new(user_id(), "owner@example.com");
    user.quotas = quotas;
    store.insert_user(user);
    store
}

fn user_id() -> UserId {
    UserId::new(USER).unwrap()
}

fn signed(action: Action, plan: &str, payment_id: &str) -> ReconcileRequest {
    let order_id = format!("order_{payment_id}");
    ReconcileRequest {
        action,
        user_id: USER.to_owned(),
        target_plan_title: plan.to_owned(),
        signature: PaymentSigner::new(SECRET.to_vec()).sign(&order_id, payment_id),
        order_id,
        payment_id: payment_id.to_owned(),
        amount_paid: None,
    }
}

/// Links the user to a paid subscription covering `start..expiry`.
fn seed_subscription(
    store: &InMemoryEntitlementStore,
    plan: &PlanDefinition,
    start: DateTime<Utc>,
    expiry: DateTime<Utc>,
) {
    let mut subscription = Subscription::open(
        user_id(),
        plan,
        PaymentRecord {
            transaction_id: TransactionId::new("pay_seed").unwrap(),
            order_id: OrderId::new("order_seed").unwrap(),
            price_paid: plan.price,
            expected_price: plan.price,
        },
        start,
    )
    .unwrap();
    subscription.expiry_date = expiry;
    store.seed_subscription(subscription);
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<(String, InvoiceSnapshot)>>,
}

impl InvoiceNotifier for RecordingNotifier {
    async fn send_invoice<'a>(
        &'a self,
        email: &'a str,
        invoice: &'a InvoiceSnapshot,
    ) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push((email.to_owned(), invoice.clone()));
        Ok(())
    }
}

struct BrokenNotifier;

impl InvoiceNotifier for BrokenNotifier {
    async fn send_invoice<'a>(
        &'a self,
        _email: &'a str,
        _invoice: &'a InvoiceSnapshot,
    ) -> Result<(), NotifyError> {
        Err(NotifyError::Delivery("mailer offline".to_owned()))
    }
}

// ============================================================================
// Pricing Scenarios
// ============================================================================

#[tokio::test]
async fn test_quarterly_to_annual_midterm_upgrade() {
    let catalog = PlanCatalog::standard();
    let quarterly = catalog.lookup(PlanTitle::Quarterly).unwrap().clone();
    let store = store_with_user(quarterly.quotas);
    let start = Utc::now() - ChronoDuration::days(45);
    seed_subscription(&store, &quarterly, start, start + ChronoDuration::days(90));

    let reconciler = build(catalog, &store, Arc::new(NoopNotifier), fast_settings());
    let outcome =
        reconciler.try_reconcile(&signed(Action::Upgrade, "Annual", "pay_up")).await.unwrap();

    let quote = outcome.quote.unwrap();
    assert_eq!(quote.total_days, 90);
    assert_eq!(quote.elapsed_days, 45);
    assert_eq!(quote.remaining_credit, Money::from_minor(4_500));
    assert_eq!(outcome.subscription.price_paid, Money::from_minor(25_488));
    assert_eq!(outcome.subscription.plan_title, PlanTitle::Annual);
    assert_eq!(outcome.subscription.revision, 2);
    assert_eq!(
        outcome.subscription.expiry_date,
        term_end(outcome.subscription.start_date, 12).unwrap()
    );

    let user = store.user(&user_id()).unwrap();
    assert_eq!(user.current_plan, PlanTier::Paid(PlanTitle::Annual));
    assert_eq!(user.quotas, Quotas::new(60, 12, 30));
    assert_eq!(store.history_for(&user_id()).len(), 1);
}

#[tokio::test]
async fn test_floor_rounding_from_config() {
    let config = EngineConfig::from_toml("rounding = \"floor\"").unwrap();
    let catalog = config.catalog().unwrap();
    let quarterly = catalog.lookup(PlanTitle::Quarterly).unwrap().clone();
    let store = store_with_user(quarterly.quotas);
    let start = Utc::now() - ChronoDuration::days(45);
    seed_subscription(&store, &quarterly, start, start + ChronoDuration::days(90));

    let reconciler = build(catalog, &store, Arc::new(NoopNotifier), config.settings());
    let outcome =
        reconciler.try_reconcile(&signed(Action::Upgrade, "Annual", "pay_up")).await.unwrap();
    assert_eq!(outcome.subscription.price_paid, Money::from_minor(25_489));
}

#[tokio::test]
async fn test_upgrade_after_term_used_up_charges_full_price() {
    let catalog = PlanCatalog::standard();
    let quarterly = catalog.lookup(PlanTitle::Quarterly).unwrap().clone();
    let store = store_with_user(Quotas::default());
    let start = Utc::now() - ChronoDuration::days(100);
    seed_subscription(&store, &quarterly, start, start + ChronoDuration::days(90));

    let reconciler = build(catalog, &store, Arc::new(NoopNotifier), fast_settings());
    let outcome =
        reconciler.try_reconcile(&signed(Action::Upgrade, "HalfYearly", "pay_up")).await.unwrap();
    assert_eq!(outcome.subscription.price_paid, Money::from_minor(15_999));
}

#[tokio::test]
async fn test_quota_delta_clamps_at_zero() {
    let plan = |title, order, price, quotas| PlanDefinition {
        title,
        order,
        term_months: 3,
        price: Money::from_minor(price),
        original_price: Money::from_minor(price),
        quotas,
        features: Default::default(),
    };
    let catalog = PlanCatalog::from_definitions(
        7,
        vec![
            plan(PlanTitle::Quarterly, 1, 1_000, Quotas::new(10, 2, 5)),
            plan(PlanTitle::Annual, 2, 3_000, Quotas::new(60, 12, 2)),
        ],
    )
    .unwrap();
    let quarterly = catalog.lookup(PlanTitle::Quarterly).unwrap().clone();
    let store = store_with_user(Quotas::new(4, 0, 1));
    let start = Utc::now() - ChronoDuration::days(10);
    seed_subscription(&store, &quarterly, start, start + ChronoDuration::days(90));

    let reconciler = build(catalog, &store, Arc::new(NoopNotifier), fast_settings());
    let outcome =
        reconciler.try_reconcile(&signed(Action::Upgrade, "Annual", "pay_up")).await.unwrap();

    assert_eq!(outcome.quota_delta, Quotas::new(50, 10, -3));
    assert_eq!(store.user(&user_id()).unwrap().quotas, Quotas::new(54, 10, 0));
}

// ============================================================================
// Renewal Window
// ============================================================================

#[tokio::test]
async fn test_renewal_two_days_before_expiry() {
    let catalog = PlanCatalog::standard();
    let annual = catalog.lookup(PlanTitle::Annual).unwrap().clone();
    let store = store_with_user(Quotas::new(5, 1, 0));
    let now = Utc::now();
    seed_subscription(
        &store,
        &annual,
        now - ChronoDuration::days(363),
        now + ChronoDuration::days(2),
    );

    let reconciler = build(catalog, &store, Arc::new(NoopNotifier), fast_settings());
    assert_eq!(reconciler.plan_state(USER).await.unwrap().state, PlanState::ExpiringSoon);

    let outcome =
        reconciler.try_reconcile(&signed(Action::Renew, "Annual", "pay_renew")).await.unwrap();

    let subscription = &outcome.subscription;
    assert!(subscription.start_date >= now);
    assert!(subscription.start_date - now < ChronoDuration::seconds(5));
    assert_eq!(subscription.expiry_date, term_end(subscription.start_date, 12).unwrap());
    assert_eq!(subscription.price_paid, Money::from_minor(29_988));
    assert_eq!(subscription.transaction_id.as_str(), "pay_renew");
    assert_eq!(store.user(&user_id()).unwrap().quotas, Quotas::new(65, 13, 30));
    assert_eq!(reconciler.plan_state(USER).await.unwrap().state, PlanState::ActiveTerm);
}

#[tokio::test]
async fn test_renewal_ten_days_before_expiry_rejected() {
    let catalog = PlanCatalog::standard();
    let annual = catalog.lookup(PlanTitle::Annual).unwrap().clone();
    let store = store_with_user(annual.quotas);
    let now = Utc::now();
    seed_subscription(
        &store,
        &annual,
        now - ChronoDuration::days(355),
        now + ChronoDuration::days(10),
    );

    let reconciler = build(catalog, &store, Arc::new(NoopNotifier), fast_settings());
    let result = reconciler.reconcile(&signed(Action::Renew, "Annual", "pay_renew")).await;

    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::RenewalNotAllowed));
    assert_eq!(store.commit_count(), 0);
}

#[tokio::test]
async fn test_renewal_of_lapsed_plan_rejected() {
    let catalog = PlanCatalog::standard();
    let quarterly = catalog.lookup(PlanTitle::Quarterly).unwrap().clone();
    let store = store_with_user(Quotas::default());
    let now = Utc::now();
    seed_subscription(
        &store,
        &quarterly,
        now - ChronoDuration::days(95),
        now - ChronoDuration::days(5),
    );

    let reconciler = build(catalog, &store, Arc::new(NoopNotifier), fast_settings());
    let result = reconciler.reconcile(&signed(Action::Renew, "Quarterly", "pay_renew")).await;
    assert_eq!(result.error_kind, Some(ErrorKind::RenewalNotAllowed));

    let result = reconciler.reconcile(&signed(Action::Purchase, "Quarterly", "pay_again")).await;
    assert_eq!(result.error_kind, Some(ErrorKind::PlanAlreadyActive));
    assert_eq!(store.commit_count(), 0);

    let result = reconciler.reconcile(&signed(Action::Purchase, "Annual", "pay_annual")).await;
    assert!(result.success);
    assert_eq!(store.history_for(&user_id()).len(), 1);
}

// ============================================================================
// Idempotency and Trust
// ============================================================================

#[tokio::test]
async fn test_replayed_payment_is_duplicate() {
    let store = store_with_user(Quotas::default());
    let reconciler =
        build(PlanCatalog::standard(), &store, Arc::new(NoopNotifier), fast_settings());
    let request = signed(Action::Purchase, "Quarterly", "pay_once");

    let first = reconciler.reconcile(&request).await;
    let second = reconciler.reconcile(&request).await;

    assert!(first.success);
    assert_eq!(second.error_kind, Some(ErrorKind::DuplicateTransaction));
    assert_eq!(store.commit_count(), 1);
    assert_eq!(store.user(&user_id()).unwrap().quotas, Quotas::new(10, 2, 5));
}

#[tokio::test]
async fn test_superseded_payment_id_stays_duplicate() {
    let catalog = PlanCatalog::standard();
    let store = store_with_user(Quotas::default());
    let reconciler = build(catalog, &store, Arc::new(NoopNotifier), fast_settings());

    let purchase = signed(Action::Purchase, "Quarterly", "pay_first");
    assert!(reconciler.reconcile(&purchase).await.success);
    assert!(reconciler.reconcile(&signed(Action::Upgrade, "Annual", "pay_second")).await.success);

    let replay = reconciler.reconcile(&purchase).await;
    assert_eq!(replay.error_kind, Some(ErrorKind::DuplicateTransaction));
    assert_eq!(store.transaction_count(), 2);
}

#[tokio::test]
async fn test_tampered_confirmation_rejected() {
    let store = store_with_user(Quotas::default());
    let reconciler =
        build(PlanCatalog::standard(), &store, Arc::new(NoopNotifier), fast_settings());

    let mut swapped_payment = signed(Action::Purchase, "Annual", "pay_real");
    swapped_payment.payment_id = "pay_forged".to_owned();

    let mut flipped = signed(Action::Purchase, "Annual", "pay_real");
    let last = if flipped.signature.ends_with('0') { '1' } else { '0' };
    flipped.signature.pop();
    flipped.signature.push(last);

    let mut wrong_secret = signed(Action::Purchase, "Annual", "pay_real");
    wrong_secret.signature =
        PaymentSigner::new(b"other".to_vec()).sign(&wrong_secret.order_id, "pay_real");

    for request in [swapped_payment, flipped, wrong_secret] {
        let result = reconciler.reconcile(&request).await;
        assert_eq!(result.error_kind, Some(ErrorKind::PaymentVerificationFailed));
    }
    assert_eq!(store.commit_count(), 0);
    assert_eq!(store.user(&user_id()).unwrap().current_plan, PlanTier::Free);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_replays_apply_once() {
    let store = store_with_user(Quotas::default());
    let reconciler =
        Arc::new(build(PlanCatalog::standard(), &store, Arc::new(NoopNotifier), fast_settings()));
    let request = signed(Action::Purchase, "HalfYearly", "pay_race");

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let reconciler = Arc::clone(&reconciler);
            let request = request.clone();
            tokio::spawn(async move { reconciler.reconcile(&request).await })
        })
        .collect();

    let mut successes = 0;
    for handle in handles {
        let result = handle.await.unwrap();
        if result.success {
            successes += 1;
        } else {
            assert_eq!(result.error_kind, Some(ErrorKind::DuplicateTransaction));
        }
    }

    assert_eq!(successes, 1);
    assert_eq!(store.commit_count(), 1);
    assert_eq!(store.user(&user_id()).unwrap().quotas, Quotas::new(25, 5, 12));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_competing_engines_share_one_store() {
    let store = store_with_user(Quotas::default());
    let first =
        Arc::new(build(PlanCatalog::standard(), &store, Arc::new(NoopNotifier), fast_settings()));
    let second =
        Arc::new(build(PlanCatalog::standard(), &store, Arc::new(NoopNotifier), fast_settings()));

    let a = {
        let engine = Arc::clone(&first);
        tokio::spawn(async move {
            engine.reconcile(&signed(Action::Purchase, "Quarterly", "pay_a")).await
        })
    };
    let b = {
        let engine = Arc::clone(&second);
        tokio::spawn(async move {
            engine.reconcile(&signed(Action::Purchase, "Annual", "pay_b")).await
        })
    };
    let results = [a.await.unwrap(), b.await.unwrap()];

    assert_eq!(results.iter().filter(|r| r.success).count(), 1);
    assert!(
        results
            .iter()
            .any(|r| r.error_kind == Some(ErrorKind::PlanAlreadyActive))
    );
    assert_eq!(store.commit_count(), 1);
    assert!(store.user(&user_id()).unwrap().is_consistent());
}

// ============================================================================
// Storage Failures
// ============================================================================

#[tokio::test]
async fn test_failure_between_writes_leaves_nothing() {
    let store = store_with_user(Quotas::default());
    let settings = ReconcilerSettings { retry: RetryPolicy::no_retry(), ..fast_settings() };
    let reconciler = build(PlanCatalog::standard(), &store, Arc::new(NoopNotifier), settings);
    store.fail_commits(FailPoint::AfterUserWrite, 1);

    let request = signed(Action::Purchase, "Annual", "pay_atomic");
    let result = reconciler.reconcile(&request).await;

    assert_eq!(result.error_kind, Some(ErrorKind::StorageUnavailable));
    let user = store.user(&user_id()).unwrap();
    assert_eq!(user.current_plan, PlanTier::Free);
    assert_eq!(user.quotas, Quotas::default());
    assert_eq!(user.version, 0);
    assert!(store.subscription_for(&user_id()).is_none());
    assert_eq!(store.transaction_count(), 0);

    // the same payment goes through once storage recovers
    assert!(reconciler.reconcile(&request).await.success);
}

#[tokio::test]
async fn test_transient_failures_retried() {
    let store = store_with_user(Quotas::default());
    let reconciler =
        build(PlanCatalog::standard(), &store, Arc::new(NoopNotifier), fast_settings());
    store.fail_commits(FailPoint::BeforeCommit, 1);
    store.fail_reads(1);

    let result = reconciler.reconcile(&signed(Action::Purchase, "Quarterly", "pay_retry")).await;
    assert!(result.success);
    assert_eq!(store.commit_count(), 1);
}

#[tokio::test]
async fn test_retries_exhausted() {
    let store = store_with_user(Quotas::default());
    let reconciler =
        build(PlanCatalog::standard(), &store, Arc::new(NoopNotifier), fast_settings());
    store.fail_commits(FailPoint::BeforeCommit, 10);

    let result = reconciler.reconcile(&signed(Action::Purchase, "Quarterly", "pay_retry")).await;
    assert_eq!(result.error_kind, Some(ErrorKind::StorageUnavailable));
    assert_eq!(store.commit_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_hung_store_times_out() {
    let store = store_with_user(Quotas::default());
    let settings = ReconcilerSettings {
        store_timeout: Duration::from_millis(100),
        ..fast_settings()
    };
    let reconciler = build(PlanCatalog::standard(), &store, Arc::new(NoopNotifier), settings);
    store.set_latency(Duration::from_secs(30));

    let result = reconciler.reconcile(&signed(Action::Purchase, "Quarterly", "pay_slow")).await;
    assert_eq!(result.error_kind, Some(ErrorKind::StorageUnavailable));
    assert_eq!(store.commit_count(), 0);
}

// ============================================================================
// Notifications
// ============================================================================

#[tokio::test]
async fn test_invoice_sent_after_commit() {
    let store = store_with_user(Quotas::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let reconciler = build(PlanCatalog::standard(), &store, Arc::clone(&notifier), fast_settings());

    let outcome =
        reconciler.try_reconcile(&signed(Action::Purchase, "Quarterly", "pay_mail")).await.unwrap();

    let mut sent = Vec::new();
    for _ in 0..100 {
        sent = notifier.sent.lock().unwrap().clone();
        if !sent.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(sent.len(), 1);
    let (email, invoice) = &sent[0];
    assert_eq!(email, "owner@example.com");
    assert_eq!(invoice.action, Action::Purchase);
    assert_eq!(invoice.amount_charged, Money::from_minor(8_999));
    assert_eq!(invoice.subscription_id, outcome.subscription.id);
}

#[tokio::test]
async fn test_invoice_failure_does_not_fail_reconcile() {
    let store = store_with_user(Quotas::default());
    let reconciler =
        build(PlanCatalog::standard(), &store, Arc::new(BrokenNotifier), fast_settings());

    let result = reconciler.reconcile(&signed(Action::Purchase, "Quarterly", "pay_mail")).await;
    assert!(result.success);
    assert_eq!(store.commit_count(), 1);
}

// ============================================================================
// Wire Format
// ============================================================================

#[tokio::test]
async fn test_result_wire_format() {
    let store = store_with_user(Quotas::default());
    let reconciler =
        build(PlanCatalog::standard(), &store, Arc::new(NoopNotifier), fast_settings());

    let request: ReconcileRequest = serde_json::from_value(serde_json::json!({
        "action": "purchase",
        "userId": USER,
        "targetPlanTitle": "Half-Yearly",
        "orderId": "order_wire",
        "paymentId": "pay_wire",
        "signature": PaymentSigner::new(SECRET.to_vec()).sign("order_wire", "pay_wire"),
        "amountPaid": 15_999
    }))
    .unwrap();

    let json = serde_json::to_value(reconciler.reconcile(&request).await).unwrap();
    assert_eq!(json["success"], true);
    assert_eq!(json["subscription"]["planTitle"], "HalfYearly");
    assert_eq!(json["subscription"]["pricePaid"], 15_999);
    assert_eq!(json["subscription"]["transactionId"], "pay_wire");
    assert!(json.get("errorKind").is_none());

    let json = serde_json::to_value(reconciler.reconcile(&request).await).unwrap();
    assert_eq!(json, serde_json::json!({"success": false, "errorKind": "DUPLICATE_TRANSACTION"}));
}
