//! Pure quota decisions.
//!
//! [`QuotaPolicy::decide`] maps a window snapshot and the configured limits
//! to a [`QuotaDecision`]. It performs no I/O and never fails: every input
//! yields either a grant of the largest amount the remaining headroom allows
//! or a denial with a stable reason.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::amount::Amount;
use crate::error::ConfigError;
use crate::store::WindowStats;

/// Validated quota configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLimits {
    base_max_amount: Amount,
    elevated_max_amount: Amount,
    number_per_interval: u32,
    time_interval: Duration,
}

impl QuotaLimits {
    /// # Errors
    ///
    /// - [`ConfigError::NonPositive`] for a zero amount, count or interval
    /// - [`ConfigError::ElevatedBelowBase`] if the elevated ceiling is lower than the base one
    pub fn new(
        base_max_amount: Amount,
        elevated_max_amount: Amount,
        number_per_interval: u32,
        time_interval: Duration,
    ) -> Result<Self, ConfigError> {
        if base_max_amount.is_zero() {
            return Err(ConfigError::NonPositive { field: "base_max_amount" });
        }
        if elevated_max_amount.is_zero() {
            return Err(ConfigError::NonPositive { field: "elevated_max_amount" });
        }
        if number_per_interval == 0 {
            return Err(ConfigError::NonPositive { field: "number_per_interval" });
        }
        if time_interval.is_zero() {
            return Err(ConfigError::NonPositive { field: "time_interval" });
        }
        if elevated_max_amount < base_max_amount {
            return Err(ConfigError::ElevatedBelowBase);
        }
        Ok(Self {
            base_max_amount,
            elevated_max_amount,
            number_per_interval,
            time_interval,
        })
    }

    pub fn base_max_amount(&self) -> Amount {
        self.base_max_amount
    }

    pub fn elevated_max_amount(&self) -> Amount {
        self.elevated_max_amount
    }

    pub fn number_per_interval(&self) -> u32 {
        self.number_per_interval
    }

    pub fn time_interval(&self) -> Duration {
        self.time_interval
    }

    /// Effective ceiling for the given tier.
    pub fn ceiling(&self, elevated: bool) -> Amount {
        if elevated {
            self.elevated_max_amount
        } else {
            self.base_max_amount
        }
    }

    /// Start of the rolling window ending at `now` (exclusive bound).
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.time_interval)
            .ok()
            .and_then(|interval| now.checked_sub_signed(interval))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Why a request was not granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DenyReason {
    RequestCountExceeded,
    AmountExceeded,
    TransientError,
}

impl DenyReason {
    /// Stable machine-readable reason.
    pub fn as_str(self) -> &'static str {
        match self {
            DenyReason::RequestCountExceeded => "request-count-exceeded",
            DenyReason::AmountExceeded => "amount-exceeded",
            DenyReason::TransientError => "transient-error",
        }
    }

    /// Human-readable explanation for UIs.
    pub fn message(self) -> &'static str {
        match self {
            DenyReason::RequestCountExceeded => "Too many requests for this address. Try again later.",
            DenyReason::AmountExceeded => "Amount limit reached for this address. Try again later.",
            DenyReason::TransientError => "Temporary error, please retry.",
        }
    }

    /// Transient denials are the only ones worth retrying immediately.
    pub fn is_retryable(self) -> bool {
        matches!(self, DenyReason::TransientError)
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a quota evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    /// Zero whenever `allowed` is false.
    pub granted_amount: Amount,
    pub reason: Option<DenyReason>,
}

impl QuotaDecision {
    pub fn allow(amount: Amount) -> Self {
        Self {
            allowed: true,
            granted_amount: amount,
            reason: None,
        }
    }

    pub fn deny(reason: DenyReason) -> Self {
        Self {
            allowed: false,
            granted_amount: Amount::ZERO,
            reason: Some(reason),
        }
    }

    /// Denial used when the store could not be consulted.
    pub fn transient() -> Self {
        Self::deny(DenyReason::TransientError)
    }

    pub fn reason_message(&self) -> &'static str {
        self.reason.map_or("ok", DenyReason::as_str)
    }
}

/// Stateless decision logic.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuotaPolicy;

impl QuotaPolicy {
    pub fn decide(stats: &WindowStats, limits: &QuotaLimits, elevated: bool) -> QuotaDecision {
        let ceiling = limits.ceiling(elevated);

        if stats.request_count >= u64::from(limits.number_per_interval) {
            return QuotaDecision::deny(DenyReason::RequestCountExceeded);
        }

        match ceiling.checked_sub(stats.total_amount) {
            Some(remaining) if !remaining.is_zero() => {
                QuotaDecision::allow(remaining.min(ceiling))
            }
            _ => QuotaDecision::deny(DenyReason::AmountExceeded),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn limits(base: u128, elevated: u128, per_interval: u32) -> QuotaLimits {
        QuotaLimits::new(
            Amount::from_base_units(base),
            Amount::from_base_units(elevated),
            per_interval,
            Duration::from_secs(86_400),
        )
        .unwrap()
    }

    fn stats(total: u128, count: u64) -> WindowStats {
        WindowStats {
            total_amount: Amount::from_base_units(total),
            request_count: count,
            ..WindowStats::default()
        }
    }

    #[test]
    fn fresh_identity_gets_full_ceiling() {
        let d = QuotaPolicy::decide(&stats(0, 0), &limits(1000, 5000, 1), false);
        assert!(d.allowed);
        assert_eq!(d.granted_amount, Amount::from_base_units(1000));
        assert_eq!(d.reason_message(), "ok");
    }

    #[test]
    fn elevated_tier_raises_ceiling() {
        let d = QuotaPolicy::decide(&stats(0, 0), &limits(1000, 5000, 1), true);
        assert_eq!(d.granted_amount, Amount::from_base_units(5000));
    }

    #[test]
    fn partial_fill_uses_remaining_headroom() {
        let d = QuotaPolicy::decide(&stats(950, 1), &limits(1000, 1000, 3), false);
        assert!(d.allowed);
        assert_eq!(d.granted_amount, Amount::from_base_units(50));
    }

    #[test]
    fn count_checked_before_amount() {
        let d = QuotaPolicy::decide(&stats(1000, 1), &limits(1000, 1000, 1), false);
        assert_eq!(d, QuotaDecision::deny(DenyReason::RequestCountExceeded));
        assert_eq!(d.reason_message(), "request-count-exceeded");
    }

    #[test]
    fn exhausted_amount_is_denied_not_zero_grant() {
        let d = QuotaPolicy::decide(&stats(1000, 1), &limits(1000, 1000, 5), false);
        assert!(!d.allowed);
        assert_eq!(d.granted_amount, Amount::ZERO);
        assert_eq!(d.reason, Some(DenyReason::AmountExceeded));
    }

    #[test]
    fn over_ceiling_history_is_denied() {
        // Prior grants under an elevated tier may exceed the base ceiling.
        let d = QuotaPolicy::decide(&stats(4000, 1), &limits(1000, 5000, 5), false);
        assert_eq!(d.reason, Some(DenyReason::AmountExceeded));
    }

    #[test]
    fn limits_validation() {
        let one = Amount::from_base_units(1);
        let day = Duration::from_secs(86_400);
        assert_eq!(
            QuotaLimits::new(Amount::ZERO, one, 1, day),
            Err(ConfigError::NonPositive { field: "base_max_amount" })
        );
        assert_eq!(
            QuotaLimits::new(one, one, 0, day),
            Err(ConfigError::NonPositive { field: "number_per_interval" })
        );
        assert_eq!(
            QuotaLimits::new(one, one, 1, Duration::ZERO),
            Err(ConfigError::NonPositive { field: "time_interval" })
        );
        assert_eq!(
            QuotaLimits::new(Amount::from_base_units(2), one, 1, day),
            Err(ConfigError::ElevatedBelowBase)
        );
    }

    #[test]
    fn window_start_subtracts_interval() {
        let now = DateTime::from_timestamp(200_000, 0).unwrap();
        let l = limits(1, 1, 1);
        assert_eq!(l.window_start(now).timestamp(), 200_000 - 86_400);
    }

    #[test]
    fn decision_serializes_reason_as_kebab() {
        let json = serde_json::to_value(QuotaDecision::deny(DenyReason::AmountExceeded)).unwrap();
        assert_eq!(json["reason"], "amount-exceeded");
        assert_eq!(json["granted_amount"], "0");
        assert_eq!(json["allowed"], false);
        assert!(DenyReason::TransientError.is_retryable());
        assert!(!DenyReason::AmountExceeded.is_retryable());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        /// Repeatedly granting within one window never exceeds either limit.
        #[test]
        fn grants_never_exceed_limits(
            base in 1u128..1_000_000,
            extra in 0u128..1_000_000,
            per_interval in 1u32..20,
            elevated in any::<bool>(),
            prior in 0u128..2_000_000,
        ) {
            let l = limits(base, base + extra, per_interval);
            let ceiling = l.ceiling(elevated);
            let mut window = stats(prior.min(ceiling.base_units()), 0);

            for _ in 0..(per_interval + 3) {
                let d = QuotaPolicy::decide(&window, &l, elevated);
                if d.allowed {
                    prop_assert!(!d.granted_amount.is_zero());
                    window.total_amount = window.total_amount.saturating_add(d.granted_amount);
                    window.request_count += 1;
                } else {
                    prop_assert!(d.granted_amount.is_zero());
                }
                prop_assert!(window.total_amount <= ceiling);
                prop_assert!(window.request_count <= u64::from(per_interval));
            }
        }
    }
}
