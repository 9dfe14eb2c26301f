//! In-memory entitlement store with failure injection.

use std::{
    collections::{HashMap, hash_map::Entry},
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use tracing::debug;

use crate::catalog::PlanTier;
use super::{
    EntitlementStore, StoreError, StoreResult, Subscription, SubscriptionId, TransactionId,
    UnitOfWork, UserAccount, UserId,
};

/// Point in the commit path where an injected failure fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    /// Before anything is staged.
    BeforeCommit,
    /// After the staged user update, before the subscription write.
    AfterUserWrite,
}

#[derive(Debug, Clone, Default)]
struct State {
    users: HashMap<UserId, UserAccount>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    history: Vec<Subscription>,
    ledger: HashMap<TransactionId, SubscriptionId>,
}

impl State {
    fn find_by_transaction(&self, transaction_id: &TransactionId) -> Option<Subscription> {
        let record_id = self.ledger.get(transaction_id)?;
        self.subscriptions
            .get(record_id)
            .filter(|s| &s.transaction_id == transaction_id)
            .or_else(|| self.history.iter().find(|s| &s.transaction_id == transaction_id))
            .cloned()
    }
}

/// Decrements `counter` if it is positive. Returns `true` if it was.
fn take(counter: &AtomicU32) -> bool {
    counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
}

/// Entitlement store backed by process memory.
///
/// Commits stage changes on a copy of the state and publish it in one step,
/// so an injected failure anywhere in the commit path leaves no partial
/// write. Every superseded subscription revision is kept in a history list
/// and every accepted transaction id in a ledger.
///
/// # Examples
///
/// ```
/// use plan_reconciler::entitlement::{InMemoryEntitlementStore, UserAccount, UserId};
///
/// let store = InMemoryEntitlementStore::new();
/// let user_id = UserId::new("user_1").unwrap();
/// store.insert_user(UserAccount::new(user_id.clone(), "a@example.com"));
/// assert!(store.user(&user_id).is_some());
/// ```
#[derive(Debug, Default)]
pub struct InMemoryEntitlementStore {
    state: Mutex<State>,
    fail_reads: AtomicU32,
    fail_before_commit: AtomicU32,
    fail_after_user_write: AtomicU32,
    latency_ms: AtomicU64,
    commits: AtomicU64,
}

impl InMemoryEntitlementStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| StoreError::Integrity("store state poisoned".to_owned()))
    }

    /// Inserts or replaces a user.
    pub fn insert_user(&self, user: UserAccount) {
        if let Ok(mut state) = self.lock() {
            state.users.insert(user.id.clone(), user);
        }
    }

    /// Inserts a user only if the id is not taken yet.
    ///
    /// Returns `false` and leaves the existing account untouched otherwise.
    pub fn insert_new_user(&self, user: UserAccount) -> bool {
        let Ok(mut state) = self.lock() else {
            return false;
        };
        match state.users.entry(user.id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(user);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    /// Inserts a subscription and links its owner to it, bypassing commit
    /// checks. Intended for seeding fixtures.
    ///
    /// The owner must already exist; otherwise nothing happens.
    pub fn seed_subscription(&self, subscription: Subscription) {
        let Ok(mut state) = self.lock() else { return };
        let Some(user) = state.users.get_mut(&subscription.user_id) else { return };
        user.current_plan = PlanTier::Paid(subscription.plan_title);
        user.active_plan_id = Some(subscription.id.clone());
        state.ledger.insert(subscription.transaction_id.clone(), subscription.id.clone());
        state.subscriptions.insert(subscription.id.clone(), subscription);
    }

    /// Snapshot of a user.
    #[must_use]
    pub fn user(&self, user_id: &UserId) -> Option<UserAccount> {
        self.lock().ok()?.users.get(user_id).cloned()
    }

    /// Snapshot of the subscription currently linked to a user.
    #[must_use]
    pub fn subscription_for(&self, user_id: &UserId) -> Option<Subscription> {
        let state = self.lock().ok()?;
        let record_id = state.users.get(user_id)?.active_plan_id.as_ref()?;
        state.subscriptions.get(record_id).cloned()
    }

    /// Superseded revisions belonging to a user, oldest first.
    #[must_use]
    pub fn history_for(&self, user_id: &UserId) -> Vec<Subscription> {
        self.lock()
            .map(|state| {
                state.history.iter().filter(|s| &s.user_id == user_id).cloned().collect()
            })
            .unwrap_or_default()
    }

    /// Number of transaction ids recorded.
    #[must_use]
    pub fn transaction_count(&self) -> usize {
        self.lock().map(|state| state.ledger.len()).unwrap_or_default()
    }

    /// Number of successful commits.
    #[must_use]
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Makes the next `times` reads fail with [`StoreError::Unavailable`].
    pub fn fail_reads(&self, times: u32) {
        self.fail_reads.store(times, Ordering::SeqCst);
    }

    /// Makes the next `times` commits fail at `point`.
    pub fn fail_commits(&self, point: FailPoint, times: u32) {
        let counter = match point {
            FailPoint::BeforeCommit => &self.fail_before_commit,
            FailPoint::AfterUserWrite => &self.fail_after_user_write,
        };
        counter.store(times, Ordering::SeqCst);
    }

    /// Delays every operation by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(millis, Ordering::SeqCst);
    }

    async fn simulate_latency(&self) {
        let millis = self.latency_ms.load(Ordering::SeqCst);
        if millis > 0 {
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }
    }

    async fn before_read(&self) -> StoreResult<()> {
        self.simulate_latency().await;
        if take(&self.fail_reads) {
            return Err(StoreError::Unavailable("injected read failure".to_owned()));
        }
        Ok(())
    }

    fn commit(&self, unit: UnitOfWork) -> StoreResult<()> {
        if take(&self.fail_before_commit) {
            return Err(StoreError::Unavailable("injected failure before commit".to_owned()));
        }
        unit.check()?;

        let mut state = self.lock()?;

        let stored = state.users.get(&unit.user.id).ok_or_else(|| {
            StoreError::Integrity(format!("unknown user {}", unit.user.id))
        })?;
        if stored.version != unit.expected_user_version() {
            return Err(StoreError::VersionConflict {
                user_id: unit.user.id.to_string(),
                expected: unit.expected_user_version(),
                found: stored.version,
            });
        }
        let previous_link = stored.active_plan_id.clone();
        if state.ledger.contains_key(&unit.subscription.transaction_id) {
            return Err(StoreError::DuplicateTransaction(
                unit.subscription.transaction_id.to_string(),
            ));
        }

        let mut staged = state.clone();

        let mut user = unit.user;
        user.version = user.version.saturating_add(1);
        staged.users.insert(user.id.clone(), user);

        if take(&self.fail_after_user_write) {
            return Err(StoreError::Unavailable("injected failure after user write".to_owned()));
        }

        let subscription = unit.subscription;
        if let Some(linked) = previous_link
            && linked != subscription.id
            && let Some(old) = staged.subscriptions.remove(&linked)
        {
            staged.history.push(old);
        }
        if let Some(previous) =
            staged.subscriptions.insert(subscription.id.clone(), subscription.clone())
        {
            staged.history.push(previous);
        }
        staged.ledger.insert(subscription.transaction_id.clone(), subscription.id.clone());

        *state = staged;
        self.commits.fetch_add(1, Ordering::SeqCst);
        debug!(
            user_id = %subscription.user_id,
            subscription_id = %subscription.id,
            revision = subscription.revision,
            "Committed unit of work"
        );
        Ok(())
    }
}

impl EntitlementStore for InMemoryEntitlementStore {
    async fn find_subscription_by_transaction_id<'a>(
        &'a self,
        transaction_id: &'a TransactionId,
    ) -> StoreResult<Option<Subscription>> {
        self.before_read().await?;
        Ok(self.lock()?.find_by_transaction(transaction_id))
    }

    async fn get_user_by_id<'a>(&'a self, user_id: &'a UserId) -> StoreResult<Option<UserAccount>> {
        self.before_read().await?;
        Ok(self.lock()?.users.get(user_id).cloned())
    }

    async fn get_active_subscription<'a>(
        &'a self,
        user_id: &'a UserId,
    ) -> StoreResult<Option<Subscription>> {
        self.before_read().await?;
        let state = self.lock()?;
        Ok(state
            .users
            .get(user_id)
            .and_then(|user| user.active_plan_id.as_ref())
            .and_then(|record_id| state.subscriptions.get(record_id))
            .cloned())
    }

    async fn run_atomic(&self, unit: UnitOfWork) -> StoreResult<()> {
        self.simulate_latency().await;
        self.commit(unit)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, Utc};

    use super::*;
    use crate::{
        catalog::{Money, PlanCatalog, PlanTitle},
        entitlement::{OrderId, PaymentRecord},
    };

    fn user_id() -> UserId {
        UserId::new("user_1").unwrap()
    }

    fn payment(tx: &str) -> PaymentRecord {
        PaymentRecord {
            transaction_id: TransactionId::new(tx).unwrap(),
            order_id: OrderId::new("order_1").unwrap(),
            price_paid: Money::from_minor(8_999),
            expected_price: Money::from_minor(8_999),
        }
    }

    fn purchase_unit(store: &InMemoryEntitlementStore, tx: &str) -> UnitOfWork {
        let catalog = PlanCatalog::standard();
        let plan = catalog.lookup(PlanTitle::Quarterly).unwrap();
        let mut user = store.user(&user_id()).unwrap();
        let sub = Subscription::open(user_id(), plan, payment(tx), Utc::now()).unwrap();
        user.current_plan = PlanTier::Paid(plan.title);
        user.active_plan_id = Some(sub.id.clone());
        user.quotas = user.quotas.apply_delta(plan.quotas);
        UnitOfWork::new(user, sub)
    }

    fn seeded() -> InMemoryEntitlementStore {
        let store = InMemoryEntitlementStore::new();
        store.insert_user(UserAccount::new(user_id(), "a@example.com"));
        store
    }

    #[test]
    fn test_insert_new_user_keeps_existing_account() {
        let store = seeded();
        let mut renamed = UserAccount::new(user_id(), "b@example.com");
        renamed.version = 7;

        assert!(!store.insert_new_user(renamed));
        let user = store.user(&user_id()).unwrap();
        assert_eq!(user.email, "a@example.com");
        assert_eq!(user.version, 0);

        assert!(store.insert_new_user(UserAccount::new(UserId::new("user_2").unwrap(), "c@x.io")));
    }

    #[tokio::test]
    async fn test_commit_applies_user_and_subscription() {
        let store = seeded();
        let unit = purchase_unit(&store, "pay_1");
        let sub_id = unit.subscription.id.clone();

        store.run_atomic(unit).await.unwrap();

        let user = store.user(&user_id()).unwrap();
        assert_eq!(user.version, 1);
        assert_eq!(user.active_plan_id, Some(sub_id));
        assert!(user.is_consistent());
        let tx = TransactionId::new("pay_1").unwrap();
        assert!(store.find_subscription_by_transaction_id(&tx).await.unwrap().is_some());
        assert_eq!(store.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_transaction_rejected() {
        let store = seeded();
        store.run_atomic(purchase_unit(&store, "pay_1")).await.unwrap();

        let result = store.run_atomic(purchase_unit(&store, "pay_1")).await;
        assert!(matches!(result, Err(StoreError::DuplicateTransaction(_))));
    }

    #[tokio::test]
    async fn test_stale_version_rejected() {
        let store = seeded();
        let stale = purchase_unit(&store, "pay_1");
        store.run_atomic(purchase_unit(&store, "pay_2")).await.unwrap();

        let result = store.run_atomic(stale).await;
        assert!(matches!(result, Err(StoreError::VersionConflict { expected: 0, found: 1, .. })));
    }

    #[tokio::test]
    async fn test_failure_after_user_write_leaves_nothing() {
        let store = seeded();
        store.fail_commits(FailPoint::AfterUserWrite, 1);

        let result = store.run_atomic(purchase_unit(&store, "pay_1")).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));

        let user = store.user(&user_id()).unwrap();
        assert_eq!(user, UserAccount::new(user_id(), "a@example.com"));
        assert_eq!(store.transaction_count(), 0);
        assert_eq!(store.commit_count(), 0);

        store.run_atomic(purchase_unit(&store, "pay_1")).await.unwrap();
        assert_eq!(store.transaction_count(), 1);
    }

    #[tokio::test]
    async fn test_overwrite_moves_previous_revision_to_history() {
        let store = seeded();
        let first = purchase_unit(&store, "pay_1");
        let original = first.subscription.clone();
        store.run_atomic(first).await.unwrap();

        let user = store.user(&user_id()).unwrap();
        let catalog = PlanCatalog::standard();
        let annual = catalog.lookup(PlanTitle::Annual).unwrap();
        let next = original.next_revision(annual, payment("pay_2"), Utc::now()).unwrap();
        let mut updated = user.clone();
        updated.current_plan = PlanTier::Paid(PlanTitle::Annual);
        store.run_atomic(UnitOfWork::new(updated, next)).await.unwrap();

        let history = store.history_for(&user_id());
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].transaction_id.as_str(), "pay_1");

        let old_tx = TransactionId::new("pay_1").unwrap();
        let found = store.find_subscription_by_transaction_id(&old_tx).await.unwrap().unwrap();
        assert_eq!(found.revision, 1);
        assert_eq!(found.plan_title, PlanTitle::Quarterly);
    }

    #[tokio::test]
    async fn test_injected_read_failures() {
        let store = seeded();
        store.fail_reads(2);
        assert!(store.get_user_by_id(&user_id()).await.is_err());
        assert!(store.get_active_subscription(&user_id()).await.is_err());
        assert!(store.get_user_by_id(&user_id()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_integrity_check_rejects_unlinked_user() {
        let store = seeded();
        let mut unit = purchase_unit(&store, "pay_1");
        unit.user.active_plan_id = None;
        let result = store.run_atomic(unit).await;
        assert!(matches!(result, Err(StoreError::Integrity(_))));
    }

    #[tokio::test]
    async fn test_seeded_subscription_is_active() {
        let store = seeded();
        let catalog = PlanCatalog::standard();
        let plan = catalog.lookup(PlanTitle::Annual).unwrap();
        let start = Utc::now() - ChronoDuration::days(10);
        let sub = Subscription::open(user_id(), plan, payment("pay_seed"), start).unwrap();
        store.seed_subscription(sub.clone());

        let active = store.get_active_subscription(&user_id()).await.unwrap();
        assert_eq!(active, Some(sub));
        assert!(store.user(&user_id()).unwrap().is_consistent());
    }
}
