//! Paper-trading gateway for dry runs: live prices, simulated fills.

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::info;

use crate::error::{EngineError, Result};
use crate::models::Side;

use super::{ExecutionGateway, OrderBookClient, SellFill, SellOrder};

/// Prices from the public order book; sells fill at the worst price the
/// slippage tolerance allows.
pub struct PaperGateway {
    book: OrderBookClient,
}

impl PaperGateway {
    pub fn new(book: OrderBookClient) -> Self {
        Self { book }
    }
}

#[async_trait]
impl ExecutionGateway for PaperGateway {
    async fn get_price(&self, instrument_id: &str, side: Side) -> Result<Option<Decimal>> {
        self.book.best_price(instrument_id, side).await
    }

    async fn sell(&self, order: &SellOrder) -> Result<SellFill> {
        simulate_fill(order)
    }
}

fn simulate_fill(order: &SellOrder) -> Result<SellFill> {
    let price = order.limit_price();
    if price <= Decimal::ZERO || order.shares <= Decimal::ZERO {
        return Err(EngineError::Execution(format!(
            "cannot fill {} shares at {}",
            order.shares, price
        )));
    }

    let realized_pnl = (price - order.entry_price) * order.shares;
    info!(
        position_id = order.position_id,
        shares = %order.shares,
        price = %price,
        pnl = %realized_pnl,
        "[DRY RUN] Simulated sell"
    );

    Ok(SellFill {
        realized_pnl,
        fill_price: price,
        order_id: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading::SlippageClass;
    use rust_decimal_macros::dec;

    fn order(shares: Decimal) -> SellOrder {
        SellOrder {
            position_id: 3,
            instrument_id: "tok".to_string(),
            market: "mkt".to_string(),
            shares,
            entry_price: dec!(0.40),
            reference_price: dec!(0.50),
            slippage: SlippageClass::Conservative,
            max_slippage: dec!(0.002),
        }
    }

    #[test]
    fn test_fill_at_slippage_limit() {
        let fill = simulate_fill(&order(dec!(100))).unwrap();
        assert_eq!(fill.fill_price, dec!(0.499));
        assert_eq!(fill.realized_pnl, dec!(9.9));
    }

    #[test]
    fn test_empty_order_rejected() {
        assert!(matches!(
            simulate_fill(&order(Decimal::ZERO)),
            Err(EngineError::Execution(_))
        ));
    }
}
