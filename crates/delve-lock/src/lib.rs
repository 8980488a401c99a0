//! delve-lock — advisory, time-boxed locks.
//!
//! A lock is a `(type, target)` record with an expiry. It debounces
//! duplicate side effects (teardown scheduling, environment automation,
//! per-player throttles). It is not a mutex: [`Locker::try_acquire`] is a
//! check followed by a write, and two callers racing through the gap may
//! both acquire. Every guarded action tolerates running twice.
//!
//! Callers hold an `Arc<dyn Locker>` so the store-backed implementation
//! can be swapped without touching them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use delve_core::epoch_secs;
use delve_state::{Lock, StateError, StateStore};

/// Lock types used across the control plane.
pub mod kinds {
    /// Per instance: a teardown command was already scheduled.
    pub const TEARDOWN: &str = "tear-down-empty-dungeon";
    /// Environment-wide: empty dungeons were already told to shut down.
    pub const SHUTDOWN_ALL: &str = "shutdown-all-empty-dungeons";
    /// Per player: trade request throttle.
    pub const TRADE_REQUEST: &str = "trade-request";
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock store error: {0}")]
    State(#[from] StateError),
}

pub type LockResult<T> = Result<T, LockError>;

#[async_trait]
pub trait Locker: Send + Sync {
    /// True if an unexpired lock exists.
    async fn present(&self, lock_type: &str, target: &str) -> LockResult<bool>;

    /// Write a fresh lock expiring after `ttl`, replacing any existing one.
    async fn acquire(&self, lock_type: &str, target: &str, ttl: Duration) -> LockResult<()>;

    /// Acquire unless already present. Not atomic.
    async fn try_acquire(&self, lock_type: &str, target: &str, ttl: Duration) -> LockResult<bool> {
        if self.present(lock_type, target).await? {
            return Ok(false);
        }
        self.acquire(lock_type, target, ttl).await?;
        Ok(true)
    }

    /// Remove an unexpired lock early. Returns whether one was removed.
    async fn release(&self, lock_type: &str, target: &str) -> LockResult<bool>;
}

pub type SharedLocker = Arc<dyn Locker>;

/// [`Locker`] backed by the redb `locks` table.
#[derive(Clone)]
pub struct StoreLocker {
    state: StateStore,
}

impl StoreLocker {
    pub fn new(state: StateStore) -> Self {
        Self { state }
    }

    pub fn shared(state: StateStore) -> SharedLocker {
        Arc::new(Self::new(state))
    }
}

#[async_trait]
impl Locker for StoreLocker {
    async fn present(&self, lock_type: &str, target: &str) -> LockResult<bool> {
        let now = epoch_secs();
        Ok(self
            .state
            .get_lock(lock_type, target)?
            .is_some_and(|lock| lock.is_active(now)))
    }

    async fn acquire(&self, lock_type: &str, target: &str, ttl: Duration) -> LockResult<()> {
        let now = epoch_secs();
        let lock = Lock {
            lock_type: lock_type.to_string(),
            target: target.to_string(),
            until: now + ttl.as_secs(),
            created_at: now,
        };
        self.state.put_lock(&lock)?;
        debug!(%lock_type, %target, until = lock.until, "lock acquired");
        Ok(())
    }

    async fn release(&self, lock_type: &str, target: &str) -> LockResult<bool> {
        if !self.present(lock_type, target).await? {
            return Ok(false);
        }
        Ok(self.state.delete_lock(lock_type, target)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locker() -> (StateStore, StoreLocker) {
        let state = StateStore::open_in_memory().unwrap();
        (state.clone(), StoreLocker::new(state))
    }

    #[tokio::test]
    async fn acquire_then_present() {
        let (_, locker) = locker();
        assert!(!locker.present(kinds::TEARDOWN, "d001").await.unwrap());

        locker
            .acquire(kinds::TEARDOWN, "d001", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(locker.present(kinds::TEARDOWN, "d001").await.unwrap());
        assert!(!locker.present(kinds::TEARDOWN, "d002").await.unwrap());
    }

    #[tokio::test]
    async fn try_acquire_debounces() {
        let (_, locker) = locker();
        let ttl = Duration::from_secs(30);
        assert!(locker.try_acquire(kinds::TRADE_REQUEST, "alex", ttl).await.unwrap());
        assert!(!locker.try_acquire(kinds::TRADE_REQUEST, "alex", ttl).await.unwrap());
        assert!(locker.try_acquire(kinds::TRADE_REQUEST, "blair", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lock_is_not_present() {
        let (state, locker) = locker();
        state
            .put_lock(&Lock {
                lock_type: kinds::TEARDOWN.into(),
                target: "d001".into(),
                until: 1000,
                created_at: 940,
            })
            .unwrap();

        assert!(!locker.present(kinds::TEARDOWN, "d001").await.unwrap());
        assert!(!locker.release(kinds::TEARDOWN, "d001").await.unwrap());
        assert!(
            locker
                .try_acquire(kinds::TEARDOWN, "d001", Duration::from_secs(60))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn release_frees_the_lock() {
        let (_, locker) = locker();
        let ttl = Duration::from_secs(60);
        locker.acquire(kinds::SHUTDOWN_ALL, "env", ttl).await.unwrap();

        assert!(locker.release(kinds::SHUTDOWN_ALL, "env").await.unwrap());
        assert!(!locker.present(kinds::SHUTDOWN_ALL, "env").await.unwrap());
        assert!(locker.try_acquire(kinds::SHUTDOWN_ALL, "env", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn works_through_trait_object() {
        let state = StateStore::open_in_memory().unwrap();
        let shared: SharedLocker = StoreLocker::shared(state);
        assert!(
            shared
                .try_acquire(kinds::TEARDOWN, "d009", Duration::from_secs(5))
                .await
                .unwrap()
        );
    }
}
