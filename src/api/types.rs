//! API response types for the Polymarket Data API.

use rust_decimal::Decimal;
use serde::Deserialize;

/// Row of the /positions endpoint. Only the fields the ledger needs.
#[derive(Debug, Clone, Deserialize)]
pub struct PositionResponse {
    /// Outcome token ID
    #[serde(default)]
    pub asset: String,
    pub size: Decimal,
}
