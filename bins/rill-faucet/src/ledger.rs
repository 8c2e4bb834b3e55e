//! JSON-RPC access to the ledger: transfers, balances and node info.
//!
//! The faucet never signs transactions itself; the wallet daemon behind
//! `rpc_endpoint` holds the faucet keys and broadcasts `sendtoaddress` calls.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use jsonrpsee::core::client::ClientT;
use jsonrpsee::core::params::ArrayParams;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use serde::Serialize;

use rill_quota::Amount;

/// Summary of the node the faucet talks to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    pub height: u64,
    pub network: String,
}

/// The external ledger as seen by the faucet.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Send `amount` to `address`. Returns the transaction ID on success.
    async fn transfer(&self, address: &str, amount: Amount) -> Result<String>;

    /// Total unspent value held by `address`.
    async fn balance_of(&self, address: &str) -> Result<Amount>;

    async fn node_info(&self) -> Result<NodeInfo>;
}

/// [`Ledger`] backed by a node/wallet JSON-RPC endpoint.
pub struct RpcLedger {
    client: HttpClient,
}

impl RpcLedger {
    pub fn new(endpoint: &str) -> Result<Self> {
        let client = HttpClientBuilder::default()
            .build(endpoint)
            .context("Failed to build RPC client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Ledger for RpcLedger {
    async fn transfer(&self, address: &str, amount: Amount) -> Result<String> {
        if amount.is_zero() {
            bail!("Amount must be greater than zero");
        }
        let mut params = ArrayParams::new();
        params.insert(address).context("encode address")?;
        params.insert(amount.to_string()).context("encode amount")?;

        let txid: String = self
            .client
            .request("sendtoaddress", params)
            .await
            .context("RPC sendtoaddress failed")?;
        Ok(txid)
    }

    async fn balance_of(&self, address: &str) -> Result<Amount> {
        let mut params = ArrayParams::new();
        params.insert(address).context("encode address")?;

        let utxos: Vec<serde_json::Value> = self
            .client
            .request("getutxosbyaddress", params)
            .await
            .context("RPC getutxosbyaddress failed")?;
        Ok(utxos.iter().filter_map(|u| utxo_value(&u["value"])).sum())
    }

    async fn node_info(&self) -> Result<NodeInfo> {
        let info: serde_json::Value = self
            .client
            .request("getinfo", ArrayParams::new())
            .await
            .context("RPC getinfo failed")?;
        Ok(parse_node_info(&info))
    }
}

/// UTXO values arrive as integers from the node and as strings from newer
/// wallets; accept both.
fn utxo_value(value: &serde_json::Value) -> Option<Amount> {
    match value {
        serde_json::Value::Number(n) => n.as_u64().map(|v| Amount::from_base_units(u128::from(v))),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn parse_node_info(info: &serde_json::Value) -> NodeInfo {
    NodeInfo {
        height: info["blocks"].as_u64().unwrap_or(0),
        network: info["network"].as_str().unwrap_or("testnet").to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn utxo_values_from_numbers_and_strings() {
        let utxos = [
            json!({"value": 1_000}),
            json!({"value": "340282366920938463463374607431768211455"}),
            json!({"value": -5}),
            json!({"value": null}),
        ];
        let values: Vec<Option<Amount>> = utxos.iter().map(|u| utxo_value(&u["value"])).collect();
        assert_eq!(values[0], Some(Amount::from_base_units(1_000)));
        assert_eq!(values[1], Some(Amount::from_base_units(u128::MAX)));
        assert_eq!(values[2], None);
        assert_eq!(values[3], None);
    }

    #[test]
    fn node_info_defaults() {
        let info = parse_node_info(&json!({"blocks": 42}));
        assert_eq!(
            info,
            NodeInfo {
                height: 42,
                network: "testnet".into()
            }
        );
    }

    #[test]
    fn rpc_ledger_rejects_bad_endpoint() {
        assert!(RpcLedger::new("not a url").is_err());
    }
}
