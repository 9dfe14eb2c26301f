//! Persistence seam for users and subscriptions.
//!
//! The reconciler talks to storage only through [`EntitlementStore`]. Every
//! mutation goes through [`EntitlementStore::run_atomic`]: the user's quota
//! update and the subscription write land together or not at all.
//!
//! Implementations must enforce two things on commit, independent of any
//! in-process locking:
//!
//! - a transaction id is accepted at most once, across every subscription
//!   revision ever stored ([`StoreError::DuplicateTransaction`])
//! - the stored user version equals [`UnitOfWork::expected_user_version`]
//!   ([`StoreError::VersionConflict`])
//!
//! [`InMemoryEntitlementStore`] is the reference implementation.

mod memory;
mod models;

pub use memory::{FailPoint, InMemoryEntitlementStore};
pub use models::{
    OrderId, PaymentRecord, Subscription, SubscriptionId, TransactionId, UserAccount, UserId,
    term_end,
};
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failures reported by an [`EntitlementStore`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Backend unreachable or failed mid-operation. Nothing was applied.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The call did not finish within the configured timeout.
    #[error("store operation timed out")]
    Timeout,

    /// Commit rejected: the transaction id is already recorded.
    #[error("transaction id already recorded: {0}")]
    DuplicateTransaction(String),

    /// Commit rejected: the user changed since it was read.
    #[error("user {user_id} changed concurrently (expected version {expected}, found {found})")]
    VersionConflict {
        /// User whose record moved.
        user_id: String,
        /// Version the writer read.
        expected: u64,
        /// Version currently stored.
        found: u64,
    },

    /// The unit of work would break a record invariant.
    #[error("integrity violation: {0}")]
    Integrity(String),
}

impl StoreError {
    /// Returns `true` when a fresh attempt may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout | Self::VersionConflict { .. })
    }
}

/// One atomic change: the new user state plus the subscription revision that
/// justifies it.
///
/// The previous revision of `subscription` (same id), and any other record the
/// user was linked to, move into history on commit.
#[derive(Debug, Clone)]
pub struct UnitOfWork {
    /// User state to write. Its `version` is the version that was read.
    pub user: UserAccount,
    /// Subscription revision to write.
    pub subscription: Subscription,
}

impl UnitOfWork {
    /// Pairs a user update with a subscription write.
    #[must_use]
    pub const fn new(user: UserAccount, subscription: Subscription) -> Self {
        Self { user, subscription }
    }

    /// Version the stored user must still have for the commit to apply.
    #[must_use]
    pub const fn expected_user_version(&self) -> u64 {
        self.user.version
    }

    /// Checks the invariants a commit must preserve.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Integrity`] if the user is not linked to the
    /// subscription, the subscription belongs to someone else, a counter is
    /// negative, or the term is empty.
    pub fn check(&self) -> StoreResult<()> {
        if self.subscription.user_id != self.user.id {
            return Err(StoreError::Integrity(format!(
                "subscription {} does not belong to user {}",
                self.subscription.id, self.user.id
            )));
        }
        if self.user.active_plan_id.as_ref() != Some(&self.subscription.id) {
            return Err(StoreError::Integrity(format!(
                "user {} is not linked to subscription {}",
                self.user.id, self.subscription.id
            )));
        }
        if self.user.current_plan.title() != Some(self.subscription.plan_title) {
            return Err(StoreError::Integrity(format!(
                "user {} tier does not match subscription {}",
                self.user.id, self.subscription.id
            )));
        }
        if self.user.quotas.has_negative() {
            return Err(StoreError::Integrity(format!("negative quota for user {}", self.user.id)));
        }
        if self.subscription.expiry_date <= self.subscription.start_date {
            return Err(StoreError::Integrity(format!(
                "subscription {} expires before it starts",
                self.subscription.id
            )));
        }
        Ok(())
    }
}

/// Storage collaborator for the reconciler.
///
/// Reads return owned snapshots. Writes happen only through
/// [`run_atomic`](Self::run_atomic).
pub trait EntitlementStore: Send + Sync + 'static {
    /// Looks up the subscription revision that recorded `transaction_id`,
    /// including superseded revisions.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the backend cannot be read.
    fn find_subscription_by_transaction_id<'a>(
        &'a self,
        transaction_id: &'a TransactionId,
    ) -> impl Future<Output = StoreResult<Option<Subscription>>> + Send + 'a;

    /// Loads a user.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the backend cannot be read.
    fn get_user_by_id<'a>(
        &'a self,
        user_id: &'a UserId,
    ) -> impl Future<Output = StoreResult<Option<UserAccount>>> + Send + 'a;

    /// Loads the subscription the user is currently linked to, expired or not.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the backend cannot be read.
    fn get_active_subscription<'a>(
        &'a self,
        user_id: &'a UserId,
    ) -> impl Future<Output = StoreResult<Option<Subscription>>> + Send + 'a;

    /// Applies a unit of work atomically.
    ///
    /// Dropping the returned future before it resolves must leave the store
    /// either fully committed or untouched.
    ///
    /// # Errors
    ///
    /// - [`StoreError::DuplicateTransaction`] if the transaction id is recorded
    /// - [`StoreError::VersionConflict`] if the user moved since it was read
    /// - [`StoreError::Integrity`] if [`UnitOfWork::check`] fails
    /// - [`StoreError::Unavailable`] on backend failure, with nothing applied
    fn run_atomic(&self, unit: UnitOfWork) -> impl Future<Output = StoreResult<()>> + Send + '_;

    /// Saves a user and subscription together.
    ///
    /// # Errors
    ///
    /// Same as [`run_atomic`](Self::run_atomic).
    fn save_user_and_subscription(
        &self,
        user: UserAccount,
        subscription: Subscription,
    ) -> impl Future<Output = StoreResult<()>> + Send + '_ {
        self.run_atomic(UnitOfWork::new(user, subscription))
    }
}
