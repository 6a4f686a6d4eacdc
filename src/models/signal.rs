//! Signal model: a balance change observed on a followed wallet.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Side;

/// Immutable buy/sell signal synthesized from two wallet snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Dedup key: wallet, instrument, side and the snapshot the change came from
    pub id: String,

    pub wallet: String,
    pub instrument_id: String,
    pub side: Side,

    /// Absolute change in balance (shares)
    pub size_delta: Decimal,

    /// Balance after the change
    pub new_balance: Decimal,

    /// Delta valued at the cached market price, when one was available
    pub usd_value: Option<Decimal>,

    pub detected_at: DateTime<Utc>,
}

impl Signal {
    /// Build the dedup key for a change seen in snapshot number `sequence`.
    pub fn key(wallet: &str, instrument_id: &str, side: Side, sequence: u64) -> String {
        format!("{}-{}-{}-{}", wallet, instrument_id, side.as_str(), sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_separates_snapshots() {
        let first = Signal::key("0xw", "tok", Side::Buy, 1);
        assert_eq!(first, "0xw-tok-BUY-1");
        assert_ne!(first, Signal::key("0xw", "tok", Side::Buy, 3));
        assert_ne!(first, Signal::key("0xw", "tok", Side::Sell, 1));
    }
}
