use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::domain::value_objects::UserId;

const PRUNE_FLOOR: usize = 1024;

/// One async mutex per user, created on demand and forgotten once nobody
/// holds or waits on it.
#[derive(Debug)]
pub(crate) struct UserLocks {
    inner: Mutex<LockTable>,
}

#[derive(Debug)]
struct LockTable {
    locks: HashMap<UserId, Weak<AsyncMutex<()>>>,
    prune_at: usize,
}

impl Default for UserLocks {
    fn default() -> Self {
        Self { inner: Mutex::new(LockTable { locks: HashMap::new(), prune_at: PRUNE_FLOOR }) }
    }
}

impl UserLocks {
    pub(crate) async fn acquire(&self, user_id: &UserId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut table = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            if table.locks.len() >= table.prune_at {
                table.locks.retain(|_, w| w.strong_count() > 0);
                table.prune_at = (table.locks.len() * 2).max(PRUNE_FLOOR);
            }
            match table.locks.get(user_id).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(AsyncMutex::new(()));
                    table.locks.insert(user_id.clone(), Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_user_is_exclusive() {
        let locks = Arc::new(UserLocks::default());
        let user = UserId::new("u1").unwrap();
        let guard = locks.acquire(&user).await;

        let contender = {
            let locks = locks.clone();
            let user = user.clone();
            tokio::spawn(async move { locks.acquire(&user).await; })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());
        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn test_different_users_do_not_block() {
        let locks = UserLocks::default();
        let _a = locks.acquire(&UserId::new("a").unwrap()).await;
        let b = tokio::time::timeout(Duration::from_millis(50), locks.acquire(&UserId::new("b").unwrap())).await;
        assert!(b.is_ok());
    }
}
