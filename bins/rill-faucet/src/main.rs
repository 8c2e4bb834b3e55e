//! rill-faucet — Testnet RILL faucet with per-address quotas.
//!
//! Serves a REST API at `/api/faucet`, dispensing testnet RILL within a
//! rolling per-address quota. Grants are recorded in RocksDB so limits
//! survive restarts, and a flood guard blocks origins that hammer the API.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

mod config;
mod ledger;
mod routes;

use config::{Config, LogFormat};
use ledger::{Ledger, RpcLedger};
use rill_quota::store::RocksQuotaStore;
use rill_quota::{AnomalyGuard, Safeguards, SweepTask, SystemClock};

/// Shared application state passed to every Axum handler.
#[derive(Clone)]
pub struct AppState {
    /// Quota enforcement over the persistent grant ledger.
    pub safeguards: Arc<Safeguards<RocksQuotaStore>>,
    /// Per-origin request-flood guard.
    pub guard: Arc<AnomalyGuard>,
    /// Node wallet used for transfers and balance lookups.
    pub ledger: Arc<dyn Ledger>,
    pub config: Arc<Config>,
}

/// Initialize tracing with `RUST_LOG` (default `info`) in the configured format.
fn init_logging(format: LogFormat) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("Failed to load faucet configuration")?;
    init_logging(config.log_format);

    info!(
        db = %config.db_path.display(),
        rpc = %config.rpc_endpoint,
        bind = %config.bind_addr,
        amount_rill = config.max_amount_rill(),
        requests_per_interval = config.limits.number_per_interval(),
        interval_secs = config.limits.time_interval().as_secs(),
        "Starting rill-faucet"
    );

    let store = Arc::new(
        RocksQuotaStore::open_with_lock_timeout(&config.db_path, config.lock_timeout)
            .with_context(|| {
                format!("Failed to open grant ledger at {}", config.db_path.display())
            })?,
    );
    let safeguards = Arc::new(Safeguards::new(
        Arc::clone(&store),
        config.limits,
        Arc::new(SystemClock),
    ));

    let guard = Arc::new(AnomalyGuard::new(config.guard).context("Invalid guard configuration")?);
    let sweeper = SweepTask::spawn(Arc::clone(&guard));

    let ledger = RpcLedger::new(&config.rpc_endpoint)?;

    let state = AppState {
        safeguards,
        guard,
        ledger: Arc::new(ledger),
        config: Arc::new(config.clone()),
    };

    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    info!("Listening on http://{}", config.bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received");
    })
    .await
    .context("HTTP server error")?;

    sweeper.shutdown().await;
    store.flush().context("Failed to flush grant ledger")?;
    info!("rill-faucet stopped");

    Ok(())
}
