//! Durable grant ledger.
//!
//! A [`QuotaStore`] owns every [`GrantRecord`] ever committed and answers
//! aggregate questions about them. Mutation happens only through
//! [`QuotaStore::run_atomic`] (or the lower-level [`QuotaStore::append`]),
//! both of which serialize on the record's identity so that no two callers
//! can read the same window snapshot and both commit against it.
//!
//! Two implementations are provided:
//! - [`RocksQuotaStore`] — persistent, backed by RocksDB
//! - [`MemoryQuotaStore`] — in-process, for tests and ephemeral deployments

mod locks;
mod memory;
mod rocks;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::constants::TOP_IDENTITIES;
use crate::error::StoreError;

pub use memory::MemoryQuotaStore;
pub use rocks::RocksQuotaStore;

/// An immutable record of value granted to an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantRecord {
    pub identity: String,
    pub amount: Amount,
    /// Network origin (IP) of the request that produced the grant.
    pub origin: String,
    /// Commit time, held at millisecond precision.
    pub granted_at: DateTime<Utc>,
}

impl GrantRecord {
    /// Build a record, truncating `granted_at` to whole milliseconds so that
    /// every store compares timestamps identically.
    pub fn new(
        identity: impl Into<String>,
        amount: Amount,
        origin: impl Into<String>,
        granted_at: DateTime<Utc>,
    ) -> Self {
        let granted_at =
            DateTime::from_timestamp_millis(granted_at.timestamp_millis()).unwrap_or(granted_at);
        Self {
            identity: identity.into(),
            amount,
            origin: origin.into(),
            granted_at,
        }
    }
}

/// Aggregate over one identity's grants inside a window. Never cached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WindowStats {
    pub total_amount: Amount,
    pub request_count: u64,
    pub last_grant_at: Option<DateTime<Utc>>,
    /// Oldest grant in the window, i.e. the next one to age out.
    pub first_grant_at: Option<DateTime<Utc>>,
}

impl WindowStats {
    pub(crate) fn observe(&mut self, amount: Amount, at: DateTime<Utc>) {
        self.total_amount = self.total_amount.saturating_add(amount);
        self.request_count += 1;
        self.last_grant_at = Some(self.last_grant_at.map_or(at, |last| last.max(at)));
        self.first_grant_at = Some(self.first_grant_at.map_or(at, |first| first.min(at)));
    }
}

/// Lifetime totals for one identity, as reported in [`GlobalStats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityTotal {
    pub identity: String,
    pub requests: u64,
    pub amount: Amount,
}

/// Store-wide reporting snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GlobalStats {
    pub total_requests: u64,
    pub total_amount: Amount,
    pub unique_identities: u64,
    /// Grants committed during the last hour.
    pub requests_per_hour: u64,
    /// Largest recipients by amount, at most [`TOP_IDENTITIES`] entries.
    pub top_identities: Vec<IdentityTotal>,
}

/// Durable, per-identity serializable grant storage.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Aggregate the identity's grants with `granted_at > since`.
    ///
    /// An identity with no grants yields `WindowStats::default()`.
    async fn window_stats(
        &self,
        identity: &str,
        since: DateTime<Utc>,
    ) -> Result<WindowStats, StoreError>;

    /// Insert a single record, serialized against `run_atomic` on the same identity.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Io`] if the record could not be persisted
    /// - [`StoreError::LockTimeout`] if the identity stayed locked past the wait bound
    async fn append(&self, record: GrantRecord) -> Result<(), StoreError>;

    /// Read the identity's window, let `decide` inspect it, and commit the
    /// record it returns, all while holding the identity's exclusive lock.
    ///
    /// Either the optional record is committed and `Ok(T)` returned, or nothing
    /// is written and `Err` is returned. A record for a different identity is
    /// rejected with [`StoreError::ForeignRecord`].
    async fn run_atomic<T, F>(
        &self,
        identity: &str,
        since: DateTime<Utc>,
        decide: F,
    ) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(WindowStats) -> (T, Option<GrantRecord>) + Send + 'static;

    /// Totals over every grant the identity has ever received.
    async fn lifetime_stats(&self, identity: &str) -> Result<WindowStats, StoreError> {
        self.window_stats(identity, DateTime::<Utc>::MIN_UTC).await
    }

    /// Store-wide totals; `hour_start` bounds the requests-per-hour figure.
    async fn global_stats(&self, hour_start: DateTime<Utc>) -> Result<GlobalStats, StoreError>;
}

/// Folds individual grants into a [`GlobalStats`] snapshot.
pub(crate) struct GlobalAccumulator {
    hour_start: DateTime<Utc>,
    per_identity: HashMap<String, IdentityTotal>,
    total_requests: u64,
    total_amount: Amount,
    recent: u64,
}

impl GlobalAccumulator {
    pub(crate) fn new(hour_start: DateTime<Utc>) -> Self {
        Self {
            hour_start,
            per_identity: HashMap::new(),
            total_requests: 0,
            total_amount: Amount::ZERO,
            recent: 0,
        }
    }

    pub(crate) fn observe(&mut self, identity: &str, amount: Amount, at: DateTime<Utc>) {
        self.total_requests += 1;
        self.total_amount = self.total_amount.saturating_add(amount);
        if at > self.hour_start {
            self.recent += 1;
        }
        let entry = self
            .per_identity
            .entry(identity.to_owned())
            .or_insert_with(|| IdentityTotal {
                identity: identity.to_owned(),
                requests: 0,
                amount: Amount::ZERO,
            });
        entry.requests += 1;
        entry.amount = entry.amount.saturating_add(amount);
    }

    pub(crate) fn finish(self) -> GlobalStats {
        let unique_identities = self.per_identity.len() as u64;
        let mut top: Vec<IdentityTotal> = self.per_identity.into_values().collect();
        top.sort_by(|a, b| {
            b.amount
                .cmp(&a.amount)
                .then(b.requests.cmp(&a.requests))
                .then_with(|| a.identity.cmp(&b.identity))
        });
        top.truncate(TOP_IDENTITIES);

        GlobalStats {
            total_requests: self.total_requests,
            total_amount: self.total_amount,
            unique_identities,
            requests_per_hour: self.recent,
            top_identities: top,
        }
    }
}
