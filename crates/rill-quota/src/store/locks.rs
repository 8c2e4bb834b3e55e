//! Per-identity exclusive locks with bounded waiting.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::StoreError;

/// Table of async mutexes keyed by identity.
///
/// Entries exist only while some task holds or waits on them, so the table
/// stays proportional to in-flight identities rather than to history.
pub(crate) struct IdentityLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
    timeout: Duration,
}

impl IdentityLocks {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            timeout,
        }
    }

    /// Wait for exclusive access to `identity`, at most for the configured timeout.
    ///
    /// The guard owns its table handle, so it can move into a blocking task.
    pub(crate) async fn acquire(self: &Arc<Self>, identity: &str) -> Result<IdentityGuard, StoreError> {
        let lock = Arc::clone(self.locks.entry(identity.to_owned()).or_default().value());

        match tokio::time::timeout(self.timeout, lock.lock_owned()).await {
            Ok(guard) => Ok(IdentityGuard {
                locks: Arc::clone(self),
                identity: identity.to_owned(),
                guard: Some(guard),
            }),
            Err(_) => {
                self.release(identity);
                debug!(%identity, "identity lock wait timed out");
                Err(StoreError::LockTimeout {
                    identity: identity.to_owned(),
                    waited_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    /// Drop the table entry if nobody else references it.
    fn release(&self, identity: &str) {
        self.locks
            .remove_if(identity, |_, lock| Arc::strong_count(lock) == 1);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }
}

/// Holds an identity's lock; releases and prunes the entry on drop.
pub(crate) struct IdentityGuard {
    locks: Arc<IdentityLocks>,
    identity: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl IdentityGuard {
    pub(crate) fn identity(&self) -> &str {
        &self.identity
    }
}

impl Drop for IdentityGuard {
    fn drop(&mut self) {
        self.guard.take();
        self.locks.release(&self.identity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_entry_pruned_after_release() {
        let locks = Arc::new(IdentityLocks::new(Duration::from_secs(1)));
        {
            let guard = locks.acquire("trill1a").await.unwrap();
            assert_eq!(guard.identity(), "trill1a");
            assert_eq!(locks.len(), 1);
        }
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn second_acquire_times_out_while_held() {
        let locks = Arc::new(IdentityLocks::new(Duration::from_millis(20)));
        let _held = locks.acquire("trill1a").await.unwrap();

        let err = locks.acquire("trill1a").await.err().unwrap();
        assert!(matches!(err, StoreError::LockTimeout { .. }));
        // The holder's entry survives the waiter's cleanup.
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test]
    async fn distinct_identities_do_not_contend() {
        let locks = Arc::new(IdentityLocks::new(Duration::from_millis(20)));
        let _a = locks.acquire("trill1a").await.unwrap();
        let b = locks.acquire("trill1b").await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn guard_moved_to_blocking_task_holds_lock() {
        let locks = Arc::new(IdentityLocks::new(Duration::from_millis(20)));
        let guard = locks.acquire("trill1a").await.unwrap();
        let (held_tx, held_rx) = std::sync::mpsc::channel::<()>();
        let (go_tx, go_rx) = std::sync::mpsc::channel::<()>();
        let task = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            held_tx.send(()).unwrap();
            go_rx.recv().unwrap();
        });

        held_rx.recv().unwrap();
        assert!(locks.acquire("trill1a").await.is_err());

        go_tx.send(()).unwrap();
        task.await.unwrap();
        assert_eq!(locks.len(), 0);
        assert!(locks.acquire("trill1a").await.is_ok());
    }
}
