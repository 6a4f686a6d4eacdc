//! Seams to the outside world: order execution and wallet ledgers.
//!
//! The risk engine only ever talks to an [`ExecutionGateway`] and the signal
//! detector only to a [`LedgerProvider`]; the live CLOB/Data API clients and
//! the paper gateway implement them.

use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::Result;
use crate::models::Side;
use crate::trading::SlippageClass;

/// A sell request issued by the risk engine.
#[derive(Debug, Clone)]
pub struct SellOrder {
    pub position_id: i64,
    pub instrument_id: String,
    pub market: String,

    /// Shares to sell
    pub shares: Decimal,

    /// Average entry of the position, for realized P&L
    pub entry_price: Decimal,

    /// Price the decision was made at
    pub reference_price: Decimal,

    pub slippage: SlippageClass,

    /// Accepted price deterioration as a fraction (0.01 = 1%)
    pub max_slippage: Decimal,
}

impl SellOrder {
    /// Worst acceptable fill price.
    pub fn limit_price(&self) -> Decimal {
        self.reference_price * (Decimal::ONE - self.max_slippage)
    }
}

/// Confirmed fill of a [`SellOrder`].
#[derive(Debug, Clone)]
pub struct SellFill {
    pub realized_pnl: Decimal,
    pub fill_price: Decimal,
    pub order_id: Option<String>,
}

/// Prices and sells outcome tokens.
#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    /// Current executable price for `side`, or `None` if the book is empty.
    async fn get_price(&self, instrument_id: &str, side: Side) -> Result<Option<Decimal>>;

    /// Sell shares. An `Err` means nothing was filled.
    async fn sell(&self, order: &SellOrder) -> Result<SellFill>;
}

/// Source of per-wallet position snapshots.
#[async_trait]
pub trait LedgerProvider: Send + Sync {
    /// Current balances keyed by instrument. Fails with `RateLimited` on 429
    /// and `Provider` on timeouts and server errors.
    async fn get_wallet_positions(&self, wallet: &str) -> Result<HashMap<String, Decimal>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_limit_price_applies_slippage() {
        let order = SellOrder {
            position_id: 1,
            instrument_id: "tok".to_string(),
            market: "mkt".to_string(),
            shares: dec!(10),
            entry_price: dec!(0.40),
            reference_price: dec!(0.50),
            slippage: SlippageClass::Aggressive,
            max_slippage: dec!(0.01),
        };
        assert_eq!(order.limit_price(), dec!(0.495));
    }
}
