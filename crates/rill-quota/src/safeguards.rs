//! Two-phase check/record protocol over a [`QuotaStore`].
//!
//! A request moves `CHECKED -> (external transfer) -> RECORDED`, or
//! `CHECKED -> (transfer failed) -> DISCARDED` with nothing written.
//!
//! [`Safeguards::check_if_allowed`] is advisory: it reads the window without
//! locking so callers can skip transfers that would certainly be refused.
//! [`Safeguards::record_grant`] is authoritative: it re-reads the window and
//! re-applies the policy inside [`QuotaStore::run_atomic`], and it is the only
//! path that persists a [`GrantRecord`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::amount::Amount;
use crate::clock::Clock;
use crate::error::StoreError;
use crate::policy::{QuotaDecision, QuotaLimits, QuotaPolicy};
use crate::store::{GlobalStats, GrantRecord, QuotaStore};

const HOUR: Duration = Duration::from_secs(3600);

/// Per-identity report for status endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressStats {
    pub identity: String,
    /// Lifetime number of grants.
    pub total_requests: u64,
    /// Lifetime amount granted.
    pub total_amount: Amount,
    pub last_grant_at: Option<DateTime<Utc>>,
    /// Grants still available in the current window at the base tier.
    pub remaining_requests: u64,
    /// Amount still available in the current window at the base tier.
    pub remaining_amount: Amount,
    /// Seconds until the oldest grant in the window ages out; zero if none.
    pub time_until_reset_secs: u64,
}

/// Composes a store, the quota limits and a clock into the grant protocol.
pub struct Safeguards<S> {
    store: Arc<S>,
    limits: QuotaLimits,
    clock: Arc<dyn Clock>,
}

impl<S: QuotaStore> Safeguards<S> {
    pub fn new(store: Arc<S>, limits: QuotaLimits, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            limits,
            clock,
        }
    }

    pub fn limits(&self) -> &QuotaLimits {
        &self.limits
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Phase 1: would a grant be allowed right now?
    ///
    /// Never fails; a store error yields a `transient-error` denial.
    #[doc(alias = "check_and_grant")]
    pub async fn check_if_allowed(&self, identity: &str, origin: &str, elevated: bool) -> QuotaDecision {
        let since = self.limits.window_start(self.clock.now());
        match self.store.window_stats(identity, since).await {
            Ok(stats) => {
                let decision = QuotaPolicy::decide(&stats, &self.limits, elevated);
                debug!(
                    %identity, %origin, elevated,
                    allowed = decision.allowed,
                    amount = %decision.granted_amount,
                    reason = decision.reason_message(),
                    "quota check"
                );
                decision
            }
            Err(e) => {
                warn!(%identity, %origin, error = %e, "quota check failed");
                QuotaDecision::transient()
            }
        }
    }

    /// Phase 2: atomically re-decide and, if still allowed, commit the grant.
    ///
    /// Call only after the external transfer has succeeded. Safe to call
    /// without a preceding [`check_if_allowed`](Self::check_if_allowed).
    ///
    /// # Errors
    ///
    /// Any [`StoreError`]; nothing has been written in that case and the
    /// caller should treat it as [`QuotaDecision::transient`].
    pub async fn record_grant(
        &self,
        identity: &str,
        origin: &str,
        elevated: bool,
    ) -> Result<QuotaDecision, StoreError> {
        let now = self.clock.now();
        let since = self.limits.window_start(now);
        let limits = self.limits;
        let owned_identity = identity.to_owned();
        let owned_origin = origin.to_owned();

        let result = self
            .store
            .run_atomic(identity, since, move |stats| {
                let decision = QuotaPolicy::decide(&stats, &limits, elevated);
                let record = decision.allowed.then(|| {
                    GrantRecord::new(owned_identity, decision.granted_amount, owned_origin, now)
                });
                (decision, record)
            })
            .await;

        match &result {
            Ok(decision) if decision.allowed => {
                info!(%identity, %origin, amount = %decision.granted_amount, elevated, "grant recorded");
            }
            Ok(decision) => {
                debug!(%identity, %origin, reason = decision.reason_message(), "grant refused at commit");
            }
            Err(e) => {
                warn!(%identity, %origin, error = %e, "grant commit failed");
            }
        }
        result
    }

    /// Lifetime totals plus remaining base-tier headroom in the current window.
    pub async fn address_stats(&self, identity: &str) -> Result<AddressStats, StoreError> {
        let now = self.clock.now();
        let lifetime = self.store.lifetime_stats(identity).await?;
        let window = self
            .store
            .window_stats(identity, self.limits.window_start(now))
            .await?;

        let time_until_reset_secs = window
            .first_grant_at
            .and_then(|first| {
                let interval = chrono::Duration::from_std(self.limits.time_interval()).ok()?;
                let reset_at = first.checked_add_signed(interval)?;
                let millis = (reset_at - now).num_milliseconds().max(0) as u64;
                Some(millis.div_ceil(1000))
            })
            .unwrap_or(0);

        Ok(AddressStats {
            identity: identity.to_owned(),
            total_requests: lifetime.request_count,
            total_amount: lifetime.total_amount,
            last_grant_at: lifetime.last_grant_at,
            remaining_requests: u64::from(self.limits.number_per_interval())
                .saturating_sub(window.request_count),
            remaining_amount: self.limits.ceiling(false).saturating_sub(window.total_amount),
            time_until_reset_secs,
        })
    }

    /// Store-wide totals with requests counted over the last hour.
    pub async fn global_stats(&self) -> Result<GlobalStats, StoreError> {
        let now = self.clock.now();
        let hour_start = chrono::Duration::from_std(HOUR)
            .ok()
            .and_then(|h| now.checked_sub_signed(h))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.store.global_stats(hour_start).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::policy::DenyReason;
    use crate::store::MemoryQuotaStore;

    const DAY: Duration = Duration::from_secs(86_400);

    fn start() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn setup(
        base: u128,
        per_interval: u32,
    ) -> (Safeguards<MemoryQuotaStore>, Arc<MemoryQuotaStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryQuotaStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let limits = QuotaLimits::new(
            Amount::from_base_units(base),
            Amount::from_base_units(base * 5),
            per_interval,
            DAY,
        )
        .unwrap();
        let guards = Safeguards::new(Arc::clone(&store), limits, clock.clone());
        (guards, store, clock)
    }

    #[tokio::test]
    async fn daily_single_grant_scenario() {
        let (guards, _store, clock) = setup(1000, 1);

        let first = guards.record_grant("X", "1.1.1.1", false).await.unwrap();
        assert!(first.allowed);
        assert_eq!(first.granted_amount, Amount::from_base_units(1000));

        clock.advance(Duration::from_secs(3600));
        let second = guards.record_grant("X", "1.1.1.1", false).await.unwrap();
        assert_eq!(second.reason, Some(DenyReason::RequestCountExceeded));

        clock.advance(DAY);
        let third = guards.record_grant("X", "1.1.1.1", false).await.unwrap();
        assert!(third.allowed);
        assert_eq!(third.granted_amount, Amount::from_base_units(1000));
    }

    #[tokio::test]
    async fn check_does_not_write() {
        let (guards, store, _clock) = setup(1000, 1);
        let decision = guards.check_if_allowed("X", "1.1.1.1", false).await;
        assert!(decision.allowed);
        assert!(store.is_empty());
        // Checking again still allows: no quota was consumed.
        assert!(guards.check_if_allowed("X", "1.1.1.1", false).await.allowed);
    }

    #[tokio::test]
    async fn check_maps_store_failure_to_transient() {
        let (guards, store, _clock) = setup(1000, 1);
        store.set_unavailable(true);
        let decision = guards.check_if_allowed("X", "1.1.1.1", false).await;
        assert_eq!(decision, QuotaDecision::transient());
    }

    #[tokio::test]
    async fn record_failure_leaves_store_unchanged() {
        let (guards, store, _clock) = setup(1000, 1);
        store.set_unavailable(true);
        assert!(guards.record_grant("X", "1.1.1.1", false).await.is_err());
        store.set_unavailable(false);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn elevated_commit_uses_elevated_ceiling() {
        let (guards, _store, _clock) = setup(1000, 2);
        let d = guards.record_grant("X", "1.1.1.1", true).await.unwrap();
        assert_eq!(d.granted_amount, Amount::from_base_units(5000));
    }

    #[tokio::test]
    async fn address_stats_after_grants() {
        let (guards, store, clock) = setup(1000, 5);
        for _ in 0..3 {
            store
                .append(GrantRecord::new("X", Amount::from_base_units(100), "1.1.1.1", clock.now()))
                .await
                .unwrap();
            clock.advance(Duration::from_secs(60));
        }

        let stats = guards.address_stats("X").await.unwrap();
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.total_amount, Amount::from_base_units(300));
        assert_eq!(stats.remaining_amount, Amount::from_base_units(700));
        assert_eq!(stats.remaining_requests, 2);
        assert_eq!(stats.last_grant_at, Some(start() + chrono::Duration::seconds(120)));
        // Oldest grant was at start(); now is start() + 180s.
        assert_eq!(stats.time_until_reset_secs, 86_400 - 180);
    }

    #[tokio::test]
    async fn address_stats_for_unknown_identity() {
        let (guards, _store, _clock) = setup(1000, 1);
        let stats = guards.address_stats("nobody").await.unwrap();
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.remaining_requests, 1);
        assert_eq!(stats.remaining_amount, Amount::from_base_units(1000));
        assert_eq!(stats.time_until_reset_secs, 0);
        assert_eq!(stats.last_grant_at, None);
    }

    #[tokio::test]
    async fn global_stats_uses_last_hour() {
        let (guards, _store, clock) = setup(1000, 10);
        guards.record_grant("A", "1.1.1.1", false).await.unwrap();
        clock.advance(Duration::from_secs(7200));
        guards.record_grant("B", "2.2.2.2", false).await.unwrap();

        let stats = guards.global_stats().await.unwrap();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.unique_identities, 2);
        assert_eq!(stats.requests_per_hour, 1);
        assert_eq!(stats.total_amount, Amount::from_base_units(2000));
    }
}
