//! Exit policy: decides whether, and how much of, a position to sell at a given price.
//!
//! Rules are checked in a fixed order and the first match wins:
//! stop loss, trailing stop, capital recovery, take profit, exit tiers.
//! At most one action comes out of a single evaluation.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::models::{Position, PositionStatus};

/// How much price deterioration an exit order may accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SlippageClass {
    /// Protective exits that must fill
    Aggressive,
    /// Profit-taking exits
    Conservative,
}

impl fmt::Display for SlippageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlippageClass::Aggressive => f.write_str("AGGRESSIVE"),
            SlippageClass::Conservative => f.write_str("CONSERVATIVE"),
        }
    }
}

/// Why a position is being (partially) exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    StopLoss,
    TrailingStop,
    TakeProfit,
    CapitalRecovery,
    PartialTakeProfit { trigger: Decimal },
    Manual,
}

impl ExitReason {
    pub fn slippage_class(&self) -> SlippageClass {
        match self {
            ExitReason::StopLoss | ExitReason::TrailingStop | ExitReason::Manual => {
                SlippageClass::Aggressive
            }
            _ => SlippageClass::Conservative,
        }
    }

    /// Status a position ends in when this exit removes all of its shares.
    pub fn terminal_status(&self) -> PositionStatus {
        match self {
            ExitReason::StopLoss => PositionStatus::ClosedSl,
            ExitReason::TrailingStop => PositionStatus::ClosedTrailing,
            ExitReason::TakeProfit => PositionStatus::ClosedTp,
            ExitReason::CapitalRecovery => PositionStatus::ClosedCapitalRecovery,
            ExitReason::PartialTakeProfit { .. } => PositionStatus::ClosedPartial,
            ExitReason::Manual => PositionStatus::ClosedManual,
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::StopLoss => f.write_str("STOP_LOSS"),
            ExitReason::TrailingStop => f.write_str("TRAILING_STOP"),
            ExitReason::TakeProfit => f.write_str("TAKE_PROFIT"),
            ExitReason::CapitalRecovery => f.write_str("CAPITAL_RECOVERY"),
            ExitReason::PartialTakeProfit { trigger } => {
                write!(f, "PARTIAL_TP_{}", trigger.normalize())
            }
            ExitReason::Manual => f.write_str("MANUAL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAmount {
    All,
    Shares(Decimal),
}

/// Bookkeeping the store must apply together with a successful partial fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitMark {
    None,
    /// Index into `Position::exit_tiers`
    Tier(usize),
    CapitalRecovered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitAction {
    pub amount: ExitAmount,
    pub reason: ExitReason,
    pub slippage: SlippageClass,
    pub mark: ExitMark,
}

impl ExitAction {
    fn full(reason: ExitReason) -> Self {
        Self {
            amount: ExitAmount::All,
            slippage: reason.slippage_class(),
            reason,
            mark: ExitMark::None,
        }
    }

    fn partial(reason: ExitReason, shares: Decimal, mark: ExitMark) -> Self {
        Self {
            amount: ExitAmount::Shares(shares),
            slippage: reason.slippage_class(),
            reason,
            mark,
        }
    }

    pub fn manual() -> Self {
        Self::full(ExitReason::Manual)
    }

    /// Shares to sell out of `held`.
    pub fn shares(&self, held: Decimal) -> Decimal {
        match self.amount {
            ExitAmount::All => held,
            ExitAmount::Shares(shares) => shares,
        }
    }

    pub fn is_full(&self) -> bool {
        self.amount == ExitAmount::All
    }
}

/// Outcome of evaluating one position at one price.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// Updated high-water mark, to persist whatever the action
    pub high_water_mark: Decimal,
    pub pnl_percent: Decimal,
    pub action: Option<ExitAction>,
}

/// Highest price seen so far, never below entry.
pub fn high_water_mark(position: &Position, price: Decimal) -> Decimal {
    position.highest_price.max(position.entry_price).max(price)
}

/// Evaluate the exit rules for `position` at `price`.
///
/// Pure: the caller persists the high-water mark and applies the action.
/// A zero `sl_percent` or `tp_percent` disables that rule.
pub fn evaluate(position: &Position, price: Decimal) -> Result<Evaluation> {
    if price <= Decimal::ZERO {
        return Err(EngineError::inconsistent("price", price));
    }
    if position.entry_price <= Decimal::ZERO {
        return Err(EngineError::inconsistent("entry_price", position.entry_price));
    }
    if position.shares <= Decimal::ZERO {
        return Err(EngineError::inconsistent("shares", position.shares));
    }

    let pnl_percent = position
        .pnl_percent(price)
        .ok_or_else(|| EngineError::inconsistent("entry_price", position.entry_price))?;
    let high_water_mark = high_water_mark(position, price);
    let sl = position.sl_percent.filter(|v| !v.is_zero()).map(|v| v.abs());
    let tp = position.tp_percent.filter(|v| !v.is_zero());

    let action = decide(position, price, pnl_percent, high_water_mark, sl, tp)?;

    Ok(Evaluation {
        high_water_mark,
        pnl_percent,
        action,
    })
}

fn decide(
    position: &Position,
    price: Decimal,
    pnl_percent: Decimal,
    high_water_mark: Decimal,
    sl: Option<Decimal>,
    tp: Option<Decimal>,
) -> Result<Option<ExitAction>> {
    if let Some(sl) = sl {
        if pnl_percent <= -sl {
            return Ok(Some(ExitAction::full(ExitReason::StopLoss)));
        }

        if position.use_trailing {
            let threshold = high_water_mark * (Decimal::ONE - sl / Decimal::ONE_HUNDRED);
            if price < threshold {
                return Ok(Some(ExitAction::full(ExitReason::TrailingStop)));
            }
        }
    }

    if let Some(tp) = tp {
        if pnl_percent >= tp {
            if !position.capital_recovered && position.value_usd > Decimal::ZERO {
                let to_sell = position.value_usd / price;
                if to_sell < position.shares {
                    return Ok(Some(ExitAction::partial(
                        ExitReason::CapitalRecovery,
                        to_sell,
                        ExitMark::CapitalRecovered,
                    )));
                }
            }
            return Ok(Some(ExitAction::full(ExitReason::TakeProfit)));
        }
    }

    let mut tiers: Vec<(usize, _)> = position.exit_tiers.iter().enumerate().collect();
    tiers.sort_by(|a, b| a.1.trigger_profit_percent.cmp(&b.1.trigger_profit_percent));

    let next = tiers
        .into_iter()
        .find(|(_, tier)| !tier.executed && pnl_percent >= tier.trigger_profit_percent);

    if let Some((index, tier)) = next {
        if tier.sell_percent <= Decimal::ZERO || tier.sell_percent > Decimal::ONE_HUNDRED {
            return Err(EngineError::inconsistent("sell_percent", tier.sell_percent));
        }
        let to_sell = position.shares * tier.sell_percent / Decimal::ONE_HUNDRED;
        return Ok(Some(ExitAction::partial(
            ExitReason::PartialTakeProfit {
                trigger: tier.trigger_profit_percent,
            },
            to_sell,
            ExitMark::Tier(index),
        )));
    }

    Ok(None)
}
