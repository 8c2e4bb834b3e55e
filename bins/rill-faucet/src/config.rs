//! Faucet configuration loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rill_quota::constants::DEFAULT_DECIMALS;
use rill_quota::{Amount, GuardConfig, QuotaLimits};

/// Log output format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Debug)]
pub struct Config {
    /// RillCoin node / wallet JSON-RPC endpoint.
    pub rpc_endpoint: String,
    /// Address to bind the HTTP server.
    pub bind_addr: String,
    /// RocksDB directory holding the grant ledger.
    pub db_path: PathBuf,
    /// Required prefix of recipient addresses (e.g. `trill1` on testnet).
    pub address_prefix: String,
    /// Per-address quota limits.
    pub limits: QuotaLimits,
    /// Recipient balance at or above which the elevated ceiling applies.
    /// `None` disables the elevated tier.
    pub elevated_min_balance: Option<Amount>,
    /// Upper bound on waiting for an address's commit lock.
    pub lock_timeout: Duration,
    /// Request-flood guard settings.
    pub guard: GuardConfig,
    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, falling back to defaults for unset keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let rpc_endpoint = var("FAUCET_RPC_ENDPOINT", "http://127.0.0.1:28332");
        let bind_addr = var("FAUCET_BIND_ADDR", "0.0.0.0:8080");

        let db_path = lookup("FAUCET_DB_PATH").map(PathBuf::from).unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".rill")
                .join("faucet-grants")
        });

        let address_prefix = var("FAUCET_ADDRESS_PREFIX", "trill1");
        if address_prefix.is_empty() {
            bail!("FAUCET_ADDRESS_PREFIX must not be empty");
        }

        let max_amount = parse_rill("FAUCET_MAX_AMOUNT_RILL", &var("FAUCET_MAX_AMOUNT_RILL", "10"))?;
        let elevated_max_amount = parse_rill(
            "FAUCET_ELEVATED_MAX_AMOUNT_RILL",
            &var("FAUCET_ELEVATED_MAX_AMOUNT_RILL", "50"),
        )?;
        let requests_per_interval: u32 = var("FAUCET_REQUESTS_PER_INTERVAL", "1")
            .trim()
            .parse()
            .context("FAUCET_REQUESTS_PER_INTERVAL must be a positive integer")?;
        let interval_secs = parse_secs("FAUCET_INTERVAL_SECS", &var("FAUCET_INTERVAL_SECS", "86400"))?;

        let limits = QuotaLimits::new(
            max_amount,
            elevated_max_amount,
            requests_per_interval,
            interval_secs,
        )
        .context("Invalid quota limits")?;

        let elevated_min_balance = lookup("FAUCET_ELEVATED_MIN_BALANCE_RILL")
            .map(|v| parse_rill("FAUCET_ELEVATED_MIN_BALANCE_RILL", &v))
            .transpose()?;

        let lock_timeout_ms: u64 = var("FAUCET_LOCK_TIMEOUT_MS", "5000")
            .trim()
            .parse()
            .context("FAUCET_LOCK_TIMEOUT_MS must be a positive integer")?;
        if lock_timeout_ms == 0 {
            bail!("FAUCET_LOCK_TIMEOUT_MS must be greater than zero");
        }

        let guard = GuardConfig {
            window: parse_secs("GUARD_WINDOW_SECS", &var("GUARD_WINDOW_SECS", "60"))?,
            suspicious_threshold: var("GUARD_THRESHOLD", "50")
                .trim()
                .parse()
                .context("GUARD_THRESHOLD must be a positive integer")?,
            block_duration: parse_secs("GUARD_BLOCK_SECS", &var("GUARD_BLOCK_SECS", "900"))?,
            sweep_interval: parse_secs("GUARD_SWEEP_SECS", &var("GUARD_SWEEP_SECS", "300"))?,
        };
        guard.validate().context("Invalid anomaly guard settings")?;

        let log_format = match var("FAUCET_LOG_FORMAT", "text").trim() {
            "text" => LogFormat::Text,
            "json" => LogFormat::Json,
            other => bail!("FAUCET_LOG_FORMAT must be `text` or `json`, got `{other}`"),
        };

        Ok(Config {
            rpc_endpoint,
            bind_addr,
            db_path,
            address_prefix,
            limits,
            elevated_min_balance,
            lock_timeout: Duration::from_millis(lock_timeout_ms),
            guard,
            log_format,
        })
    }

    /// Base ceiling in whole RILL (for display).
    pub fn max_amount_rill(&self) -> String {
        self.limits.base_max_amount().to_decimal_string(DEFAULT_DECIMALS)
    }
}

fn parse_rill(key: &str, value: &str) -> Result<Amount> {
    Amount::from_decimal_str(value, DEFAULT_DECIMALS)
        .with_context(|| format!("{key} must be a RILL amount like `10` or `2.5`"))
}

fn parse_secs(key: &str, value: &str) -> Result<Duration> {
    let secs: u64 = value
        .trim()
        .parse()
        .with_context(|| format!("{key} must be a positive integer"))?;
    Ok(Duration::from_secs(secs))
}
