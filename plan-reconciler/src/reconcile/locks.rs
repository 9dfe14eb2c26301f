//! Per-user serialization of reconcile attempts.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, Weak},
};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::entitlement::UserId;

/// Hands out one async mutex per user.
///
/// Entries are weak so idle users do not pin memory; dead entries are pruned
/// whenever a new lock is created.
#[derive(Debug, Default)]
pub(crate) struct UserLocks {
    inner: Mutex<HashMap<UserId, Weak<AsyncMutex<()>>>>,
}

impl UserLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `user_id`.
    pub(crate) async fn acquire(&self, user_id: &UserId) -> OwnedMutexGuard<()> {
        let lock = self.lock_for(user_id);
        lock.lock_owned().await
    }

    fn lock_for(&self, user_id: &UserId) -> Arc<AsyncMutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = map.get(user_id).and_then(Weak::upgrade) {
            return existing;
        }
        map.retain(|_, weak| weak.strong_count() > 0);
        let lock = Arc::new(AsyncMutex::new(()));
        map.insert(user_id.clone(), Arc::downgrade(&lock));
        lock
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
