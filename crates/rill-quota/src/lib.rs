//! # rill-quota
//! Grant quota enforcement and request-flood protection for the Rill faucet.
//!
//! - [`store::QuotaStore`] — durable, per-identity serialized grant ledger
//! - [`policy::QuotaPolicy`] — pure allow/deny and partial-fill decisions
//! - [`safeguards::Safeguards`] — two-phase check/record protocol and reporting
//! - [`guard::AnomalyGuard`] — in-memory sliding-window flood detector

pub mod amount;
pub mod clock;
pub mod constants;
pub mod error;
pub mod guard;
pub mod policy;
pub mod safeguards;
pub mod store;

pub use amount::Amount;
pub use clock::{Clock, ManualClock, SystemClock};
pub use guard::{AnomalyGuard, GuardConfig, SweepTask};
pub use policy::{DenyReason, QuotaDecision, QuotaLimits, QuotaPolicy};
pub use safeguards::{AddressStats, Safeguards};
pub use store::{GlobalStats, GrantRecord, IdentityTotal, QuotaStore, WindowStats};
