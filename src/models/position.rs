//! Position model: one copy-traded holding and its exit configuration.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Share counts below this are treated as a fully exited position.
pub const DUST_SHARES: Decimal = Decimal::from_parts(1, 0, 0, false, 6);

/// Direction of a trade or holding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            other => Err(format!("unknown side: {}", other)),
        }
    }
}

/// Lifecycle status. `Open` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Open,
    ClosedSl,
    ClosedTp,
    ClosedTrailing,
    ClosedPartial,
    ClosedManual,
    ClosedCapitalRecovery,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "OPEN",
            PositionStatus::ClosedSl => "CLOSED_SL",
            PositionStatus::ClosedTp => "CLOSED_TP",
            PositionStatus::ClosedTrailing => "CLOSED_TRAILING",
            PositionStatus::ClosedPartial => "CLOSED_PARTIAL",
            PositionStatus::ClosedManual => "CLOSED_MANUAL",
            PositionStatus::ClosedCapitalRecovery => "CLOSED_CAPITAL_RECOVERY",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PositionStatus::Open)
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for PositionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s {
            "OPEN" => PositionStatus::Open,
            "CLOSED_SL" => PositionStatus::ClosedSl,
            "CLOSED_TP" => PositionStatus::ClosedTp,
            "CLOSED_TRAILING" => PositionStatus::ClosedTrailing,
            "CLOSED_PARTIAL" => PositionStatus::ClosedPartial,
            "CLOSED_MANUAL" => PositionStatus::ClosedManual,
            "CLOSED_CAPITAL_RECOVERY" => PositionStatus::ClosedCapitalRecovery,
            other => return Err(format!("unknown position status: {}", other)),
        };
        Ok(status)
    }
}

/// One stage of a tiered profit-taking schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitTier {
    /// Profit percentage (e.g. 20 = +20%) at which the tier fires
    pub trigger_profit_percent: Decimal,

    /// Percentage of the *remaining* shares to sell
    pub sell_percent: Decimal,

    #[serde(default)]
    pub executed: bool,
}

impl ExitTier {
    pub fn new(trigger_profit_percent: Decimal, sell_percent: Decimal) -> Self {
        Self {
            trigger_profit_percent,
            sell_percent,
            executed: false,
        }
    }
}

/// A copy-traded position as seen by the risk engine.
#[derive(Debug, Clone)]
pub struct Position {
    pub id: i64,

    /// Outcome token traded
    pub instrument_id: String,

    /// Followed wallet whose trade opened this position
    pub source_wallet: String,

    /// Market slug or condition ID
    pub market: String,

    pub side: Side,

    /// Shares currently held
    pub shares: Decimal,

    pub entry_price: Decimal,
    pub current_price: Decimal,

    /// High-water mark since open
    pub highest_price: Decimal,

    /// Initial invested amount in USDC
    pub value_usd: Decimal,

    pub sl_percent: Option<Decimal>,
    pub tp_percent: Option<Decimal>,
    pub use_trailing: bool,
    pub exit_tiers: Vec<ExitTier>,
    pub capital_recovered: bool,

    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,

    pub status: PositionStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
}

impl Position {
    /// Profit in percent at `price` (20 = +20%). `None` if entry is not positive.
    pub fn pnl_percent(&self, price: Decimal) -> Option<Decimal> {
        if self.entry_price <= Decimal::ZERO {
            return None;
        }
        Some((price - self.entry_price) / self.entry_price * Decimal::ONE_HUNDRED)
    }

    /// Unrealized P&L in USDC for the shares still held.
    pub fn unrealized_pnl_at(&self, price: Decimal) -> Decimal {
        (price - self.entry_price) * self.shares
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }
}

/// Row written by the entry flow when a copy trade fills.
#[derive(Debug, Clone)]
pub struct NewPosition {
    pub instrument_id: String,
    pub source_wallet: String,
    pub market: String,
    pub side: Side,
    pub shares: Decimal,
    pub entry_price: Decimal,
    pub value_usd: Decimal,
    pub sl_percent: Option<Decimal>,
    pub tp_percent: Option<Decimal>,
    pub use_trailing: bool,
    pub exit_tiers: Vec<ExitTier>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn position(entry: Decimal, shares: Decimal) -> Position {
        let now = Utc::now();
        Position {
            id: 1,
            instrument_id: "tok".to_string(),
            source_wallet: "0xabc".to_string(),
            market: "will-it-rain".to_string(),
            side: Side::Buy,
            shares,
            entry_price: entry,
            current_price: entry,
            highest_price: entry,
            value_usd: entry * shares,
            sl_percent: None,
            tp_percent: None,
            use_trailing: false,
            exit_tiers: Vec::new(),
            capital_recovered: false,
            unrealized_pnl: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            status: PositionStatus::Open,
            opened_at: now,
            closed_at: None,
            last_updated: now,
        }
    }

    #[test]
    fn test_pnl_percent() {
        let pos = position(dec!(0.50), dec!(100));
        assert_eq!(pos.pnl_percent(dec!(0.60)), Some(dec!(20)));
        assert_eq!(pos.pnl_percent(dec!(0.40)), Some(dec!(-20)));
        assert_eq!(pos.unrealized_pnl_at(dec!(0.60)), dec!(10));
    }

    #[test]
    fn test_pnl_percent_rejects_zero_entry() {
        let pos = position(Decimal::ZERO, dec!(100));
        assert_eq!(pos.pnl_percent(dec!(0.60)), None);
    }

    #[test]
    fn test_status_round_trip_through_str() {
        for status in [
            PositionStatus::Open,
            PositionStatus::ClosedSl,
            PositionStatus::ClosedCapitalRecovery,
        ] {
            assert_eq!(status.as_str().parse::<PositionStatus>(), Ok(status));
        }
        assert!(!PositionStatus::Open.is_terminal());
        assert!(PositionStatus::ClosedManual.is_terminal());
    }

    #[test]
    fn test_dust_threshold() {
        assert_eq!(DUST_SHARES, dec!(0.000001));
    }

    #[test]
    fn test_tier_json_defaults_executed() {
        let tier: ExitTier =
            serde_json::from_str(r#"{"trigger_profit_percent":"20","sell_percent":"50"}"#).unwrap();
        assert_eq!(tier, ExitTier::new(dec!(20), dec!(50)));
    }
}
