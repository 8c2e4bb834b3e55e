//! Axum router and HTTP handlers.

use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use rill_quota::constants::DEFAULT_DECIMALS;
use rill_quota::{DenyReason, QuotaDecision};

use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/faucet", post(api_faucet))
        .route("/api/status", get(api_status))
        .route("/api/stats", get(api_global_stats))
        .route("/api/stats/:address", get(api_address_stats))
        .with_state(state)
        .layer(cors)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct FaucetRequest {
    address: String,
}

/// `POST /api/faucet` — dispense RILL to the requested address.
///
/// Flow: flood guard, address check, elevated-tier lookup, quota pre-check,
/// transfer, then the authoritative quota commit.
async fn api_faucet(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<FaucetRequest>,
) -> impl IntoResponse {
    let ip = extract_ip(&headers, peer.ip());
    let origin = ip.to_string();

    if !state.guard.admit(&origin) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "Too many requests from this origin. Try again later.",
                "reason": "origin-blocked",
            })),
        );
    }

    let address = req.address.trim().to_string();
    if !address.starts_with(&state.config.address_prefix) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": format!(
                    "Only addresses starting with {} are supported",
                    state.config.address_prefix
                )
            })),
        );
    }

    let elevated = is_elevated(&state, &address).await;

    let check = state
        .safeguards
        .check_if_allowed(&address, &origin, elevated)
        .await;
    if !check.allowed {
        return denial(&check);
    }

    info!(%address, %ip, elevated, amount = %check.granted_amount, "Faucet request");

    let txid = match state.ledger.transfer(&address, check.granted_amount).await {
        Ok(txid) => txid,
        Err(e) => {
            warn!(error = %e, %address, "Faucet send failed");
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": format!("Transfer failed: {e}")})),
            );
        }
    };

    // The transfer has happened; from here on the client always gets the txid.
    match state
        .safeguards
        .record_grant(&address, &origin, elevated)
        .await
    {
        Ok(commit) if commit.allowed => {
            if commit.granted_amount != check.granted_amount {
                warn!(
                    %address,
                    sent = %check.granted_amount,
                    recorded = %commit.granted_amount,
                    "Recorded amount differs from amount sent"
                );
            }
            info!(%txid, %address, "Faucet sent");
        }
        Ok(commit) => {
            warn!(
                %txid, %address,
                reason = commit.reason_message(),
                "Transfer sent but grant refused at commit"
            );
        }
        Err(e) => {
            error!(%txid, %address, error = %e, "Transfer sent but grant not recorded");
        }
    }

    (
        StatusCode::OK,
        Json(json!({
            "txid": txid,
            "amount": check.granted_amount,
            "amount_rill": check.granted_amount.to_decimal_string(DEFAULT_DECIMALS),
            "address": address,
            "elevated": elevated,
        })),
    )
}

/// `GET /api/stats/:address` — per-address usage and remaining quota.
async fn api_address_stats(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> impl IntoResponse {
    match state.safeguards.address_stats(address.trim()).await {
        Ok(stats) => (StatusCode::OK, Json(json!(stats))),
        Err(e) => {
            warn!(error = %e, %address, "Address stats unavailable");
            transient()
        }
    }
}

/// `GET /api/stats` — faucet-wide totals and top recipients.
async fn api_global_stats(State(state): State<AppState>) -> impl IntoResponse {
    match state.safeguards.global_stats().await {
        Ok(stats) => (StatusCode::OK, Json(json!(stats))),
        Err(e) => {
            warn!(error = %e, "Global stats unavailable");
            transient()
        }
    }
}

/// `GET /api/status` — node info and faucet limits.
async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let info = match state.ledger.node_info().await {
        Ok(info) => info,
        Err(e) => {
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": format!("RPC error: {e}")})),
            );
        }
    };

    let limits = state.safeguards.limits();
    (
        StatusCode::OK,
        Json(json!({
            "height": info.height,
            "network": info.network,
            "max_amount_rill": state.config.max_amount_rill(),
            "elevated_max_amount_rill": limits.elevated_max_amount().to_decimal_string(DEFAULT_DECIMALS),
            "requests_per_interval": limits.number_per_interval(),
            "interval_secs": limits.time_interval().as_secs(),
        })),
    )
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a quota denial to its HTTP response.
fn denial(decision: &QuotaDecision) -> (StatusCode, Json<serde_json::Value>) {
    let reason = decision.reason.unwrap_or(DenyReason::TransientError);
    let status = if reason.is_retryable() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::TOO_MANY_REQUESTS
    };
    (
        status,
        Json(json!({"error": reason.message(), "reason": reason.as_str()})),
    )
}

fn transient() -> (StatusCode, Json<serde_json::Value>) {
    denial(&QuotaDecision::transient())
}

/// Whether `address` qualifies for the elevated ceiling.
///
/// A failed balance lookup falls back to the base tier.
async fn is_elevated(state: &AppState, address: &str) -> bool {
    let Some(threshold) = state.config.elevated_min_balance else {
        return false;
    };
    match state.ledger.balance_of(address).await {
        Ok(balance) => balance >= threshold,
        Err(e) => {
            warn!(error = %e, %address, "Balance lookup failed; using base tier");
            false
        }
    }
}

/// Client IP from `X-Forwarded-For` or `X-Real-IP`, else the socket peer.
fn extract_ip(headers: &HeaderMap, peer: IpAddr) -> IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .and_then(|s| s.trim().parse().ok())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse().ok())
        })
        .unwrap_or(peer)
}

// =============================================================================
// Tests
// =============================================================================
