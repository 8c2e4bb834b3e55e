//! Default limits and fixed parameters.

use std::time::Duration;

/// Decimal places between one whole RILL and its base unit.
pub const DEFAULT_DECIMALS: u32 = 8;

/// Base units in one whole RILL.
pub const COIN: u128 = 100_000_000;

/// Default rolling quota window: 24 hours.
pub const DEFAULT_TIME_INTERVAL: Duration = Duration::from_secs(86_400);

/// Default number of grants per identity per window.
pub const DEFAULT_NUMBER_PER_INTERVAL: u32 = 1;

/// Default upper bound on waiting for an identity's transaction lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Default anomaly-guard counting window.
pub const DEFAULT_GUARD_WINDOW: Duration = Duration::from_secs(60);

/// Default number of requests per guard window before an origin is blocked.
pub const DEFAULT_SUSPICIOUS_THRESHOLD: u32 = 50;

/// Default time an origin stays blocked.
pub const DEFAULT_BLOCK_DURATION: Duration = Duration::from_secs(15 * 60);

/// Default interval between guard sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Number of identities reported by global statistics.
pub const TOP_IDENTITIES: usize = 10;

/// Longest accepted anomaly-guard window, block or sweep interval.
pub const MAX_GUARD_DURATION: Duration = Duration::from_secs(30 * 86_400);
