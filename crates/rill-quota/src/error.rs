//! Error types for quota enforcement.
use thiserror::Error;

/// Failures of the durable grant store. All of them are transient from the
/// caller's point of view: nothing was committed and the request may be retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("storage: {0}")] Io(String),
    #[error("codec: {0}")] Codec(String),
    #[error("lock on {identity} not acquired within {waited_ms}ms")] LockTimeout { identity: String, waited_ms: u64 },
    #[error("record for {found} committed under lock for {locked}")] ForeignRecord { locked: String, found: String },
}

/// Invalid startup configuration. Never produced per request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")] NonPositive { field: &'static str },
    #[error("elevated ceiling must not be below the base ceiling")] ElevatedBelowBase,
    #[error("invalid {field}: {reason}")] Invalid { field: &'static str, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("empty amount")] Empty,
    #[error("invalid character: {0}")] InvalidCharacter(char),
    #[error("more than {max} fractional digits")] TooManyDecimals { max: u32 },
    #[error("amount overflow")] Overflow,
}
