//! RocksDB-backed persistent grant store.
//!
//! Grants live in a single column family keyed by
//! `identity_len(u16 BE) || identity || granted_at_ms(i64, order-preserving BE) || seq(u32 BE)`,
//! so one identity's grants are contiguous and ordered by time. A window
//! query is a forward range scan from the first key after `since` to the end
//! of the identity's prefix. Every write goes through a [`WriteBatch`].
//!
//! RocksDB calls block, so each store operation runs on tokio's blocking
//! pool. `run_atomic` and `append` move the identity lock into that task:
//! dropping the caller's future cannot release the lock before the write lands.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use tracing::debug;

use super::locks::IdentityLocks;
use super::{GlobalAccumulator, GlobalStats, GrantRecord, QuotaStore, WindowStats};
use crate::amount::Amount;
use crate::constants::DEFAULT_LOCK_TIMEOUT;
use crate::error::StoreError;

const CF_GRANTS: &str = "grants";

/// Value stored under a grant key. Identity and time live in the key.
#[derive(bincode::Encode, bincode::Decode)]
struct StoredGrant {
    amount: Amount,
    origin: String,
}

/// Persistent grant store.
pub struct RocksQuotaStore {
    db: Arc<DB>,
    locks: Arc<IdentityLocks>,
}

impl RocksQuotaStore {
    /// Open or create a grant database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_lock_timeout(path, DEFAULT_LOCK_TIMEOUT)
    }

    /// Open with an explicit bound on waiting for an identity lock.
    pub fn open_with_lock_timeout(
        path: impl AsRef<Path>,
        lock_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cfs = vec![ColumnFamilyDescriptor::new(CF_GRANTS, Options::default())];
        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cfs)
            .map_err(|e| StoreError::Io(e.to_string()))?;

        Ok(Self {
            db: Arc::new(db),
            locks: Arc::new(IdentityLocks::new(lock_timeout)),
        })
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(|e| StoreError::Io(e.to_string()))
    }

    /// Run `op` against the database on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&DB) -> Result<T, StoreError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || op(&db))
            .await
            .map_err(|e| StoreError::Io(format!("storage task failed: {e}")))?
    }

    // --- Internal helpers ---

    fn cf(db: &DB) -> Result<&ColumnFamily, StoreError> {
        db.cf_handle(CF_GRANTS)
            .ok_or_else(|| StoreError::Io(format!("missing column family: {CF_GRANTS}")))
    }

    fn identity_prefix(identity: &str) -> Result<Vec<u8>, StoreError> {
        let len = u16::try_from(identity.len())
            .map_err(|_| StoreError::Codec(format!("identity too long: {} bytes", identity.len())))?;
        let mut prefix = Vec::with_capacity(2 + identity.len() + 12);
        prefix.extend_from_slice(&len.to_be_bytes());
        prefix.extend_from_slice(identity.as_bytes());
        Ok(prefix)
    }

    /// Flip the sign bit so big-endian byte order matches numeric order.
    fn time_bytes(millis: i64) -> [u8; 8] {
        ((millis as u64) ^ (1 << 63)).to_be_bytes()
    }

    fn time_from_bytes(bytes: [u8; 8]) -> i64 {
        (u64::from_be_bytes(bytes) ^ (1 << 63)) as i64
    }

    /// Split a key into `(identity, granted_at_ms)`.
    fn decode_key(key: &[u8]) -> Result<(&str, i64), StoreError> {
        let malformed = || StoreError::Codec("malformed grant key".into());
        let len_bytes: [u8; 2] = key.get(0..2).ok_or_else(malformed)?.try_into().map_err(|_| malformed())?;
        let id_end = 2 + usize::from(u16::from_be_bytes(len_bytes));
        if key.len() != id_end + 12 {
            return Err(malformed());
        }
        let identity = std::str::from_utf8(&key[2..id_end]).map_err(|_| malformed())?;
        let time: [u8; 8] = key[id_end..id_end + 8].try_into().map_err(|_| malformed())?;
        Ok((identity, Self::time_from_bytes(time)))
    }

    fn decode_value(bytes: &[u8]) -> Result<StoredGrant, StoreError> {
        let (value, _): (StoredGrant, _) =
            bincode::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| StoreError::Codec(e.to_string()))?;
        Ok(value)
    }

    fn millis_to_time(millis: i64) -> Result<DateTime<Utc>, StoreError> {
        DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| StoreError::Codec(format!("timestamp out of range: {millis}")))
    }

    fn scan_window(db: &DB, identity: &str, since: DateTime<Utc>) -> Result<WindowStats, StoreError> {
        let cf = Self::cf(db)?;
        let prefix = Self::identity_prefix(identity)?;
        let mut start = prefix.clone();
        start.extend_from_slice(&Self::time_bytes(since.timestamp_millis().saturating_add(1)));

        let mut stats = WindowStats::default();
        for item in db.iterator_cf(cf, IteratorMode::From(start.as_slice(), Direction::Forward)) {
            let (key, value) = item.map_err(|e| StoreError::Io(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            let (_, millis) = Self::decode_key(&key)?;
            let grant = Self::decode_value(&value)?;
            stats.observe(grant.amount, Self::millis_to_time(millis)?);
        }
        Ok(stats)
    }

    /// Next free sequence number for `(identity, millis)`.
    ///
    /// Only valid while the identity's lock is held.
    fn next_seq(db: &DB, prefix: &[u8], millis: i64) -> Result<u32, StoreError> {
        let cf = Self::cf(db)?;
        let mut slot = prefix.to_vec();
        slot.extend_from_slice(&Self::time_bytes(millis));

        let mut seq = 0u32;
        for item in db.iterator_cf(cf, IteratorMode::From(slot.as_slice(), Direction::Forward)) {
            let (key, _) = item.map_err(|e| StoreError::Io(e.to_string()))?;
            if !key.starts_with(&slot) {
                break;
            }
            seq = seq
                .checked_add(1)
                .ok_or_else(|| StoreError::Codec("sequence overflow".into()))?;
        }
        Ok(seq)
    }

    fn write_record(db: &DB, record: &GrantRecord) -> Result<(), StoreError> {
        let cf = Self::cf(db)?;
        let millis = record.granted_at.timestamp_millis();
        let prefix = Self::identity_prefix(&record.identity)?;
        let seq = Self::next_seq(db, &prefix, millis)?;

        let mut key = prefix;
        key.extend_from_slice(&Self::time_bytes(millis));
        key.extend_from_slice(&seq.to_be_bytes());

        let value = bincode::encode_to_vec(
            StoredGrant {
                amount: record.amount,
                origin: record.origin.clone(),
            },
            bincode::config::standard(),
        )
        .map_err(|e| StoreError::Codec(e.to_string()))?;

        let mut batch = WriteBatch::default();
        batch.put_cf(cf, &key, &value);
        db.write(batch).map_err(|e| StoreError::Io(e.to_string()))?;

        debug!(identity = %record.identity, amount = %record.amount, seq, "grant persisted");
        Ok(())
    }

    fn scan_all(db: &DB, hour_start: DateTime<Utc>) -> Result<GlobalStats, StoreError> {
        let cf = Self::cf(db)?;
        let mut acc = GlobalAccumulator::new(hour_start);
        for item in db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item.map_err(|e| StoreError::Io(e.to_string()))?;
            let (identity, millis) = Self::decode_key(&key)?;
            let grant = Self::decode_value(&value)?;
            acc.observe(identity, grant.amount, Self::millis_to_time(millis)?);
        }
        Ok(acc.finish())
    }
}

#[async_trait]
impl QuotaStore for RocksQuotaStore {
    async fn window_stats(
        &self,
        identity: &str,
        since: DateTime<Utc>,
    ) -> Result<WindowStats, StoreError> {
        let identity = identity.to_owned();
        self.blocking(move |db| Self::scan_window(db, &identity, since))
            .await
    }

    async fn append(&self, record: GrantRecord) -> Result<(), StoreError> {
        let guard = self.locks.acquire(&record.identity).await?;
        self.blocking(move |db| {
            let result = Self::write_record(db, &record);
            drop(guard);
            result
        })
        .await
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
        self.blocking(move |db| {
            let stats = Self::scan_window(db, guard.identity(), since)?;
            let (value, record) = decide(stats);
            if let Some(record) = record {
                if record.identity != guard.identity() {
                    return Err(StoreError::ForeignRecord {
                        locked: guard.identity().to_owned(),
                        found: record.identity,
                    });
                }
                Self::write_record(db, &record)?;
            }
            drop(guard);
            Ok(value)
        })
        .await
    }

    async fn global_stats(&self, hour_start: DateTime<Utc>) -> Result<GlobalStats, StoreError> {
        self.blocking(move |db| Self::scan_all(db, hour_start)).await
    }
}
