//! Polymarket Data API client: wallet position snapshots for the signal detector.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use tracing::debug;

use crate::error::{EngineError, Result};

use super::types::PositionResponse;
use super::{upstream_error, LedgerProvider};

const DATA_API_BASE: &str = "https://data-api.polymarket.com";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest page the /positions endpoint serves.
const POSITIONS_LIMIT: u32 = 500;

/// Client for the Polymarket Data API (read-only operations).
pub struct DataClient {
    client: Client,
    base_url: String,
}

impl DataClient {
    /// Create a new data client with default settings.
    pub fn new() -> anyhow::Result<Self> {
        Self::with_base_url(DATA_API_BASE.to_string())
    }

    /// Create with custom base URL (for testing).
    pub fn with_base_url(base_url: String) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, base_url })
    }

    /// Fetch open positions for a wallet.
    pub async fn get_positions(&self, address: &str) -> Result<Vec<PositionResponse>> {
        let url = format!(
            "{}/positions?user={}&limit={}",
            self.base_url, address, POSITIONS_LIMIT
        );
        debug!(url = %url, "Fetching positions");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::Provider(format!("positions request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(upstream_error(status, &body));
        }

        response
            .json()
            .await
            .map_err(|e| EngineError::Provider(format!("malformed positions response: {}", e)))
    }
}

/// Collapse a positions page into instrument → balance, dropping empty rows.
fn balances(items: Vec<PositionResponse>) -> HashMap<String, Decimal> {
    let mut balances = HashMap::new();
    for item in items {
        if item.asset.is_empty() || item.size <= Decimal::ZERO {
            continue;
        }
        *balances.entry(item.asset).or_insert(Decimal::ZERO) += item.size;
    }
    balances
}

#[async_trait]
impl LedgerProvider for DataClient {
    async fn get_wallet_positions(&self, wallet: &str) -> Result<HashMap<String, Decimal>> {
        Ok(balances(self.get_positions(wallet).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_balances_from_positions_page() {
        let items: Vec<PositionResponse> = serde_json::from_str(
            r#"[
                {"proxyWallet":"0xw","asset":"111","conditionId":"0xc1","size":12.5,"avgPrice":0.4,"curPrice":0.45,"outcome":"Yes"},
                {"proxyWallet":"0xw","asset":"222","conditionId":"0xc2","size":0,"outcome":"No"},
                {"proxyWallet":"0xw","asset":"","conditionId":"0xc3","size":3},
                {"proxyWallet":"0xw","asset":"111","conditionId":"0xc1","size":2.5}
            ]"#,
        )
        .unwrap();

        let map = balances(items);
        assert_eq!(map.len(), 1);
        assert_eq!(map["111"], dec!(15));
    }
}
