//! Per-identity reader/writer locks.
//!
//! The registry lazily allocates one lock per [`Identity`] and hands out
//! scoped guards. Guards release on drop, which covers early returns, panics
//! and cancelled futures alike.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::identity::Identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Exclusive,
    Shared,
}

#[derive(Debug, Default)]
pub struct LockRegistry {
    locks: DashMap<Identity, Arc<RwLock<()>>>,
    allocated: AtomicU64,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `identity` in the given mode.
    pub async fn acquire(&self, identity: Identity, mode: LockMode) -> IdentityGuard<'_> {
        match mode {
            LockMode::Exclusive => IdentityGuard::Exclusive(self.exclusive(identity).await),
            LockMode::Shared => IdentityGuard::Shared(self.shared(identity).await),
        }
    }

    pub async fn shared(&self, identity: Identity) -> SharedGuard {
        let lock = self.lock_for(identity);
        SharedGuard {
            _guard: lock.read_owned().await,
        }
    }

    pub async fn exclusive(&self, identity: Identity) -> ExclusiveGuard<'_> {
        let lock = self.lock_for(identity);
        let guard = Arc::clone(&lock).write_owned().await;
        ExclusiveGuard {
            registry: self,
            identity,
            lock,
            evict: false,
            _guard: guard,
        }
    }

    /// Exclusive guard for an identity that has not been committed yet.
    ///
    /// Unless [`ExclusiveGuard::keep`] is called, the registry entry is removed
    /// when the guard drops.
    pub async fn exclusive_uncommitted(&self, identity: Identity) -> ExclusiveGuard<'_> {
        let mut guard = self.exclusive(identity).await;
        guard.evict = true;
        guard
    }

    /// Number of lock objects allocated over the registry's lifetime.
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Number of identities currently holding a registry entry.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.locks.contains_key(identity)
    }

    fn lock_for(&self, identity: Identity) -> Arc<RwLock<()>> {
        // The entry holds the shard's write lock, so racing callers on a new
        // identity all end up with the same lock object.
        let entry = self.locks.entry(identity).or_insert_with(|| {
            self.allocated.fetch_add(1, Ordering::Relaxed);
            Arc::new(RwLock::new(()))
        });
        Arc::clone(entry.value())
    }

    fn remove(&self, identity: &Identity, lock: &Arc<RwLock<()>>) {
        // Only drop the entry we were holding; a later incarnation stays.
        self.locks
            .remove_if(identity, |_, existing| Arc::ptr_eq(existing, lock));
    }
}

/// Held read access to one identity.
#[derive(Debug)]
pub struct SharedGuard {
    _guard: OwnedRwLockReadGuard<()>,
}

/// Held write access to one identity.
#[derive(Debug)]
pub struct ExclusiveGuard<'a> {
    registry: &'a LockRegistry,
    identity: Identity,
    lock: Arc<RwLock<()>>,
    evict: bool,
    _guard: OwnedRwLockWriteGuard<()>,
}

impl ExclusiveGuard<'_> {
    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// Keep the registry entry when this guard drops.
    pub fn keep(&mut self) {
        self.evict = false;
    }

    /// Remove the registry entry when this guard drops.
    pub fn evict(&mut self) {
        self.evict = true;
    }
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        // Runs before `_guard` is dropped: the entry goes away while we still
        // hold the write lock.
        if self.evict {
            self.registry.remove(&self.identity, &self.lock);
            tracing::debug!(identity = %self.identity, "Released lock entry");
        }
    }
}

#[derive(Debug)]
pub enum IdentityGuard<'a> {
    Exclusive(ExclusiveGuard<'a>),
    Shared(SharedGuard),
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::identity::IdGenerator;

    fn ids(n: usize) -> Vec<Identity> {
        let generator = IdGenerator::default();
        (0..n).map(|_| generator.generate().unwrap()).collect()
    }

    #[tokio::test]
    async fn test_lock_created_lazily_once() {
        let registry = LockRegistry::new();
        let id = ids(1)[0];
        assert!(registry.is_empty());

        drop(registry.shared(id).await);
        drop(registry.exclusive(id).await);
        drop(registry.acquire(id, LockMode::Shared).await);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.allocated(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_first_access_allocates_one_lock() {
        let registry = Arc::new(LockRegistry::new());
        let id = ids(1)[0];

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    let _guard = registry.shared(id).await;
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(registry.allocated(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exclusive_same_identity_is_serialized() {
        let registry = Arc::new(LockRegistry::new());
        let id = ids(1)[0];
        let hold = Duration::from_millis(100);

        let start = Instant::now();
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    let _guard = registry.acquire(id, LockMode::Exclusive).await;
                    tokio::time::sleep(hold).await;
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(start.elapsed() >= hold * 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_different_identities_run_concurrently() {
        let registry = Arc::new(LockRegistry::new());
        let hold = Duration::from_millis(200);

        let start = Instant::now();
        let handles: Vec<_> = ids(2)
            .into_iter()
            .map(|id| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    let _guard = registry.exclusive(id).await;
                    tokio::time::sleep(hold).await;
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(start.elapsed() < hold * 2);
    }

    #[tokio::test]
    async fn test_shared_holders_block_writer() {
        let registry = LockRegistry::new();
        let id = ids(1)[0];

        let r1 = registry.shared(id).await;
        let r2 = registry.shared(id).await;

        let pending =
            tokio::time::timeout(Duration::from_millis(50), registry.exclusive(id)).await;
        assert!(pending.is_err(), "writer must wait for readers");

        drop(r1);
        drop(r2);
        let writer = tokio::time::timeout(Duration::from_millis(50), registry.exclusive(id)).await;
        assert!(writer.is_ok());
    }

    #[tokio::test]
    async fn test_uncommitted_guard_evicts_entry() {
        let registry = LockRegistry::new();
        let id = ids(1)[0];

        drop(registry.exclusive_uncommitted(id).await);
        assert!(!registry.contains(&id));
        assert_eq!(registry.allocated(), 1);

        // A new acquisition has to allocate a fresh lock object.
        drop(registry.exclusive(id).await);
        assert_eq!(registry.allocated(), 2);
        assert!(registry.contains(&id));
    }

    #[tokio::test]
    async fn test_kept_guard_retains_entry() {
        let registry = LockRegistry::new();
        let id = ids(1)[0];

        let mut guard = registry.exclusive_uncommitted(id).await;
        guard.keep();
        drop(guard);

        assert!(registry.contains(&id));
    }

    #[tokio::test]
    async fn test_cancelled_acquire_leaves_no_holder() {
        let registry = LockRegistry::new();
        let id = ids(1)[0];

        let held = registry.exclusive(id).await;
        // Abandon a waiter after a deadline.
        let abandoned =
            tokio::time::timeout(Duration::from_millis(20), registry.exclusive(id)).await;
        assert!(abandoned.is_err());
        drop(held);

        let again = tokio::time::timeout(Duration::from_millis(50), registry.exclusive(id)).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_uncommitted_create_evicts() {
        let registry = LockRegistry::new();
        let id = ids(1)[0];

        let task = async {
            let _guard = registry.exclusive_uncommitted(id).await;
            std::future::pending::<()>().await;
        };
        let _ = tokio::time::timeout(Duration::from_millis(20), task).await;

        assert!(!registry.contains(&id));
    }

    #[tokio::test]
    async fn test_evict_only_removes_own_incarnation() {
        let registry = LockRegistry::new();
        let id = ids(1)[0];

        let mut stale = registry.exclusive(id).await;
        stale.evict();
        drop(stale);
        assert!(!registry.contains(&id));

        let fresh = registry.shared(id).await;
        assert!(registry.contains(&id));
        drop(fresh);
        assert_eq!(registry.allocated(), 2);
    }
}
