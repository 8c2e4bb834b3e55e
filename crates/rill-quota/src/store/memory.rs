//! In-process grant store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::locks::IdentityLocks;
use super::{GlobalAccumulator, GlobalStats, GrantRecord, QuotaStore, WindowStats};
use crate::constants::DEFAULT_LOCK_TIMEOUT;
use crate::error::StoreError;

/// Grant store kept entirely in memory.
///
/// Same serialization guarantees as [`RocksQuotaStore`](super::RocksQuotaStore)
/// but no persistence; contents are lost on restart. Records are kept per
/// identity in `granted_at` order.
pub struct MemoryQuotaStore {
    grants: RwLock<BTreeMap<String, Vec<GrantRecord>>>,
    locks: Arc<IdentityLocks>,
    unavailable: AtomicBool,
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(timeout: Duration) -> Self {
        Self {
            grants: RwLock::new(BTreeMap::new()),
            locks: Arc::new(IdentityLocks::new(timeout)),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every subsequent operation fail with [`StoreError::Io`] until reset.
    #[cfg(test)]
    pub(crate) fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Total number of records held.
    pub fn len(&self) -> usize {
        self.grants.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Io("memory store marked unavailable".into()));
        }
        Ok(())
    }

    fn stats_since(&self, identity: &str, since: DateTime<Utc>) -> WindowStats {
        let grants = self.grants.read();
        let mut stats = WindowStats::default();
        if let Some(records) = grants.get(identity) {
            let start = records.partition_point(|r| r.granted_at <= since);
            for r in &records[start..] {
                stats.observe(r.amount, r.granted_at);
            }
        }
        stats
    }

    fn insert(&self, record: GrantRecord) {
        let mut grants = self.grants.write();
        let records = grants.entry(record.identity.clone()).or_default();
        let pos = records.partition_point(|r| r.granted_at <= record.granted_at);
        records.insert(pos, record);
    }
}

impl Default for MemoryQuotaStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn window_stats(
        &self,
        identity: &str,
        since: DateTime<Utc>,
    ) -> Result<WindowStats, StoreError> {
        self.ensure_available()?;
        Ok(self.stats_since(identity, since))
    }

    async fn append(&self, record: GrantRecord) -> Result<(), StoreError> {
        let _guard = self.locks.acquire(&record.identity).await?;
        self.ensure_available()?;
        self.insert(record);
        Ok(())
    }

    async fn run_atomic<T, F>(
        &self,
        identity: &str,
        since: DateTime<Utc>,
        decide: F,
    ) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(WindowStats) -> (T, Option<GrantRecord>) + Send + 'static,
    {
        let guard = self.locks.acquire(identity).await?;
        self.ensure_available()?;

        let (value, record) = decide(self.stats_since(identity, since));
        if let Some(record) = record {
            if record.identity != guard.identity() {
                return Err(StoreError::ForeignRecord {
                    locked: guard.identity().to_owned(),
                    found: record.identity,
                });
            }
            // Re-check so an outage that began mid-decision still writes nothing.
            self.ensure_available()?;
            self.insert(record);
        }
        Ok(value)
    }

    async fn global_stats(&self, hour_start: DateTime<Utc>) -> Result<GlobalStats, StoreError> {
        self.ensure_available()?;
        let grants = self.grants.read();
        let mut acc = GlobalAccumulator::new(hour_start);
        for (identity, records) in grants.iter() {
            for r in records {
                acc.observe(identity, r.amount, r.granted_at);
            }
        }
        Ok(acc.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::Amount;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn grant(identity: &str, amount: u128, secs: i64) -> GrantRecord {
        GrantRecord::new(identity, Amount::from_base_units(amount), "10.0.0.1", at(secs))
    }

    #[tokio::test]
    async fn empty_identity_has_zero_stats() {
        let store = MemoryQuotaStore::new();
        let stats = store.window_stats("trill1nobody", at(0)).await.unwrap();
        assert_eq!(stats, WindowStats::default());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn window_excludes_grants_at_or_before_since() {
        let store = MemoryQuotaStore::new();
        store.append(grant("trill1a", 10, 100)).await.unwrap();
        store.append(grant("trill1a", 20, 200)).await.unwrap();
        store.append(grant("trill1a", 30, 300)).await.unwrap();

        let stats = store.window_stats("trill1a", at(200)).await.unwrap();
        assert_eq!(stats.request_count, 1);
        assert_eq!(stats.total_amount, Amount::from_base_units(30));

        let lifetime = store.lifetime_stats("trill1a").await.unwrap();
        assert_eq!(lifetime.request_count, 3);
        assert_eq!(lifetime.first_grant_at, Some(at(100)));
    }

    #[tokio::test]
    async fn out_of_order_appends_stay_sorted() {
        let store = MemoryQuotaStore::new();
        store.append(grant("trill1a", 1, 300)).await.unwrap();
        store.append(grant("trill1a", 2, 100)).await.unwrap();
        let stats = store.window_stats("trill1a", at(150)).await.unwrap();
        assert_eq!(stats.total_amount, Amount::from_base_units(1));
    }

    #[tokio::test]
    async fn run_atomic_without_record_writes_nothing() {
        let store = MemoryQuotaStore::new();
        let seen = store
            .run_atomic("trill1a", at(0), |stats| (stats.request_count, None))
            .await
            .unwrap();
        assert_eq!(seen, 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn run_atomic_rejects_foreign_record() {
        let store = MemoryQuotaStore::new();
        let err = store
            .run_atomic("trill1a", at(0), |_| ((), Some(grant("trill1b", 1, 10))))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ForeignRecord { .. }));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn unavailable_store_fails_everything() {
        let store = MemoryQuotaStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.window_stats("trill1a", at(0)).await,
            Err(StoreError::Io(_))
        ));
        assert!(store.append(grant("trill1a", 1, 1)).await.is_err());
        assert!(store.global_stats(at(0)).await.is_err());

        store.set_unavailable(false);
        store.append(grant("trill1a", 1, 1)).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn global_stats_counts_recent_hour() {
        let store = MemoryQuotaStore::new();
        store.append(grant("trill1a", 5, 100)).await.unwrap();
        store.append(grant("trill1b", 7, 5_000)).await.unwrap();
        store.append(grant("trill1b", 7, 6_000)).await.unwrap();

        let stats = store.global_stats(at(3_000)).await.unwrap();
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.total_amount, Amount::from_base_units(19));
        assert_eq!(stats.unique_identities, 2);
        assert_eq!(stats.requests_per_hour, 2);
        assert_eq!(stats.top_identities[0].identity, "trill1b");
    }
}
