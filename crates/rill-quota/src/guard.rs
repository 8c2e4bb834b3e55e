//! Request-flood detection per network origin.
//!
//! Each origin moves through `UNSEEN -> TRACKING -> BLOCKED -> UNSEEN`.
//! While tracking, requests are counted in a fixed window that restarts once
//! it has fully elapsed; exceeding the threshold blocks the origin until a
//! deadline. Expired blocks are honoured lazily on the next request, and a
//! periodic [`SweepTask`] prunes stale state so memory stays bounded.
//!
//! Nothing here is persisted. A restart forgets every origin, which is fine:
//! the guard is a cheap first filter, not the quota itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::constants::{
    DEFAULT_BLOCK_DURATION, DEFAULT_GUARD_WINDOW, DEFAULT_SUSPICIOUS_THRESHOLD,
    DEFAULT_SWEEP_INTERVAL, MAX_GUARD_DURATION,
};
use crate::error::ConfigError;

/// Thresholds and timings for [`AnomalyGuard`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardConfig {
    /// Length of one counting window.
    pub window: Duration,
    /// Requests allowed per window; the next one blocks the origin.
    pub suspicious_threshold: u32,
    pub block_duration: Duration,
    pub sweep_interval: Duration,
}

impl GuardConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window.is_zero() {
            return Err(ConfigError::NonPositive { field: "guard window" });
        }
        if self.suspicious_threshold == 0 {
            return Err(ConfigError::NonPositive { field: "suspicious_threshold" });
        }
        if self.block_duration.is_zero() {
            return Err(ConfigError::NonPositive { field: "block_duration" });
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::NonPositive { field: "sweep_interval" });
        }
        for (field, value) in [
            ("guard window", self.window),
            ("block_duration", self.block_duration),
            ("sweep_interval", self.sweep_interval),
        ] {
            if value > MAX_GUARD_DURATION {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!(
                        "{}s exceeds the {}s maximum",
                        value.as_secs(),
                        MAX_GUARD_DURATION.as_secs()
                    ),
                });
            }
        }
        Ok(())
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_GUARD_WINDOW,
            suspicious_threshold: DEFAULT_SUSPICIOUS_THRESHOLD,
            block_duration: DEFAULT_BLOCK_DURATION,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SourceActivity {
    request_count: u32,
    window_start: Instant,
}

#[derive(Default)]
struct GuardState {
    activity: HashMap<String, SourceActivity>,
    /// Origin -> unblock deadline.
    blocked: HashMap<String, Instant>,
}

/// Entries removed by one [`AnomalyGuard::sweep`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub expired_activity: usize,
    pub expired_blocks: usize,
}

/// Sliding-window flood detector with timed blocking.
pub struct AnomalyGuard {
    config: GuardConfig,
    state: Mutex<GuardState>,
}

impl AnomalyGuard {
    pub fn new(config: GuardConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            state: Mutex::new(GuardState::default()),
        })
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Count a request from `origin` and decide whether to let it through.
    pub fn admit(&self, origin: &str) -> bool {
        self.admit_at(origin, Instant::now())
    }

    /// [`admit`](Self::admit) with an explicit current time.
    pub fn admit_at(&self, origin: &str, now: Instant) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if let Some(&deadline) = state.blocked.get(origin) {
            if now < deadline {
                return false;
            }
            state.blocked.remove(origin);
            state.activity.remove(origin);
        }

        let activity = state
            .activity
            .entry(origin.to_owned())
            .or_insert(SourceActivity {
                request_count: 0,
                window_start: now,
            });
        if now.saturating_duration_since(activity.window_start) >= self.config.window {
            activity.request_count = 0;
            activity.window_start = now;
        }
        activity.request_count = activity.request_count.saturating_add(1);

        let count = activity.request_count;
        if count <= self.config.suspicious_threshold {
            return true;
        }

        // `validate` bounds block_duration, so only an `Instant` near the end
        // of its range can miss; fall back to the longest accepted block.
        let deadline = now
            .checked_add(self.config.block_duration)
            .or_else(|| now.checked_add(MAX_GUARD_DURATION))
            .unwrap_or(now);
        state.activity.remove(origin);
        state.blocked.insert(origin.to_owned(), deadline);
        drop(guard);

        warn!(
            %origin,
            count,
            threshold = self.config.suspicious_threshold,
            block_secs = self.config.block_duration.as_secs(),
            "anomaly guard: origin blocked"
        );
        false
    }

    pub fn is_blocked(&self, origin: &str) -> bool {
        self.is_blocked_at(origin, Instant::now())
    }

    pub fn is_blocked_at(&self, origin: &str, now: Instant) -> bool {
        self.state
            .lock()
            .blocked
            .get(origin)
            .is_some_and(|deadline| now < *deadline)
    }

    /// Number of origins currently being counted.
    pub fn tracked_origins(&self) -> usize {
        self.state.lock().activity.len()
    }

    /// Number of block entries held, including expired ones not yet swept.
    pub fn blocked_origins(&self) -> usize {
        self.state.lock().blocked.len()
    }

    /// Drop expired windows and elapsed blocks.
    pub fn sweep(&self) -> SweepStats {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> SweepStats {
        let window = self.config.window;
        let mut state = self.state.lock();

        let before = state.activity.len();
        state
            .activity
            .retain(|_, a| now.saturating_duration_since(a.window_start) < window);
        let expired_activity = before - state.activity.len();

        let before = state.blocked.len();
        state.blocked.retain(|_, deadline| now < *deadline);
        let expired_blocks = before - state.blocked.len();

        SweepStats {
            expired_activity,
            expired_blocks,
        }
    }
}

/// Recurring [`AnomalyGuard::sweep`] owned by the process lifecycle.
pub struct SweepTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SweepTask {
    /// Start sweeping every `guard.config().sweep_interval`.
    pub fn spawn(guard: Arc<AnomalyGuard>) -> Self {
        let period = guard.config().sweep_interval;
        let (shutdown, mut stop) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let stats = guard.sweep();
                        if stats.expired_activity + stats.expired_blocks > 0 {
                            debug!(
                                expired_activity = stats.expired_activity,
                                expired_blocks = stats.expired_blocks,
                                "anomaly guard sweep"
                            );
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("anomaly guard sweep task stopped");
        });

        Self { shutdown, handle }
    }

    /// Signal the task to stop and wait for it.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "sweep task ended abnormally");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
