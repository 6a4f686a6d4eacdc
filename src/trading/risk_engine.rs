//! Risk engine: the fixed-cadence exit loop.
//!
//! Each cycle lists OPEN positions, prices them through the shared cache,
//! persists price and high-water mark, evaluates the exit policy and executes
//! at most one exit per position. A failed sell leaves the position untouched;
//! it is retried on a later cycle if the condition still holds.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{ExecutionGateway, SellFill, SellOrder};
use crate::db::{PartialExit, PartialExitOutcome, PositionStore};
use crate::error::{EngineError, Result};
use crate::models::{Position, Side};
use crate::throttle::{Pacer, PriceCache, Priority, RateLimiter, TtlClass};

use super::exit_policy::{self, ExitAction, ExitReason};
use super::RiskConfig;

/// Liveness of the engine's collaborators, published after every cycle.
#[derive(Debug, Clone, Default)]
pub struct EngineHealth {
    pub store_ok: bool,
    pub gateway_ok: bool,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub cycles: u64,
    /// Cycles in a row where the store or every price fetch failed
    pub consecutive_failures: u32,
}

/// Summary of one pass over the open positions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub evaluated: usize,
    pub no_price: usize,
    pub exits: usize,
    pub failures: usize,
    pub transient_failures: usize,
}

/// What happened to a single position in a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PositionOutcome {
    Held,
    NoPrice,
    Exited(ExitReason),
}

pub struct RiskEngine {
    store: PositionStore,
    prices: Arc<PriceCache>,
    gateway: Arc<dyn ExecutionGateway>,
    limiter: Arc<RateLimiter>,
    config: RiskConfig,
    health: Arc<RwLock<EngineHealth>>,
}

impl RiskEngine {
    pub fn new(
        store: PositionStore,
        prices: Arc<PriceCache>,
        gateway: Arc<dyn ExecutionGateway>,
        limiter: Arc<RateLimiter>,
        config: RiskConfig,
    ) -> Self {
        Self {
            store,
            prices,
            gateway,
            limiter,
            config,
            health: Arc::new(RwLock::new(EngineHealth::default())),
        }
    }

    /// Shared handle to the health snapshot.
    pub fn health(&self) -> Arc<RwLock<EngineHealth>> {
        self.health.clone()
    }

    /// Run cycles until `token` is cancelled.
    pub async fn run(&self, token: CancellationToken) {
        let pacer = Pacer::new(self.config.interval(), self.config.min_sleep());
        info!(interval_ms = self.config.interval_ms, "Risk engine started");

        while !token.is_cancelled() {
            let started = Instant::now();
            let report = self.run_cycle(&token).await;

            if report.exits > 0 || report.failures > 0 {
                info!(
                    evaluated = report.evaluated,
                    exits = report.exits,
                    failures = report.failures,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Risk cycle complete"
                );
            } else {
                debug!(
                    evaluated = report.evaluated,
                    no_price = report.no_price,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Risk cycle complete"
                );
            }

            if !pacer.wait(started, &token).await {
                break;
            }
        }

        info!("Risk engine stopped");
    }

    /// One pass over every OPEN position.
    pub async fn run_cycle(&self, token: &CancellationToken) -> CycleReport {
        let mut report = CycleReport::default();

        let positions = match self.store.get_open_positions().await {
            Ok(positions) => positions,
            Err(e) => {
                error!(error = %e, "Failed to load open positions");
                let mut health = self.health.write().await;
                health.store_ok = false;
                health.consecutive_failures += 1;
                health.cycles += 1;
                health.last_cycle_at = Some(Utc::now());
                return report;
            }
        };

        for position in &positions {
            if token.is_cancelled() {
                break;
            }

            match self.process_position(position).await {
                Ok(PositionOutcome::Held) => report.evaluated += 1,
                Ok(PositionOutcome::NoPrice) => report.no_price += 1,
                Ok(PositionOutcome::Exited(_)) => {
                    report.evaluated += 1;
                    report.exits += 1;
                }
                Err(e) => {
                    report.failures += 1;
                    if e.is_transient() {
                        report.transient_failures += 1;
                        debug!(position_id = position.id, error = %e, "Position skipped this cycle");
                    } else {
                        warn!(position_id = position.id, error = %e, "Position processing failed");
                    }
                }
            }
        }

        let mut health = self.health.write().await;
        health.store_ok = true;
        health.gateway_ok = report.transient_failures == 0 || report.evaluated > 0;
        health.cycles += 1;
        health.last_cycle_at = Some(Utc::now());
        if !positions.is_empty() && report.failures == positions.len() {
            health.consecutive_failures += 1;
        } else {
            health.consecutive_failures = 0;
        }

        report
    }

    /// Price, persist and evaluate one position, executing its exit if any.
    pub async fn process_position(&self, position: &Position) -> Result<PositionOutcome> {
        let Some(price) = self
            .prices
            .get(&position.instrument_id, Side::Sell, TtlClass::Risk)
            .await?
        else {
            debug!(position_id = position.id, instrument = %position.instrument_id, "No price, skipping");
            return Ok(PositionOutcome::NoPrice);
        };

        if price <= Decimal::ZERO {
            return Err(EngineError::inconsistent("price", price));
        }

        // Observed price and peak are stored even when the rules cannot be evaluated.
        self.store
            .update_price(position.id, price, position.unrealized_pnl_at(price))
            .await?;
        let high_water_mark = exit_policy::high_water_mark(position, price);
        if high_water_mark > position.highest_price {
            self.store
                .update_highest_price(position.id, high_water_mark)
                .await?;
        }

        let evaluation = exit_policy::evaluate(position, price)?;

        let Some(action) = evaluation.action else {
            return Ok(PositionOutcome::Held);
        };

        info!(
            position_id = position.id,
            reason = %action.reason,
            pnl_pct = %evaluation.pnl_percent.round_dp(2),
            price = %price,
            "Exit triggered"
        );

        self.execute_exit(position, price, &action).await?;
        Ok(PositionOutcome::Exited(action.reason))
    }

    /// Sell a whole OPEN position regardless of its exit rules.
    pub async fn close_manually(&self, position_id: i64) -> Result<SellFill> {
        let position = self.store.get_position(position_id).await?.ok_or_else(|| {
            EngineError::DataInconsistency(format!("position {} not found", position_id))
        })?;
        if !position.is_open() {
            return Err(EngineError::DataInconsistency(format!(
                "position {} is already {}",
                position_id, position.status
            )));
        }

        let price = self
            .prices
            .get(&position.instrument_id, Side::Sell, TtlClass::Risk)
            .await?
            .ok_or_else(|| {
                EngineError::Provider(format!("no price for {}", position.instrument_id))
            })?;

        info!(position_id, price = %price, "Manual close requested");
        self.execute_exit(&position, price, &ExitAction::manual()).await
    }

    async fn execute_exit(
        &self,
        position: &Position,
        price: Decimal,
        action: &ExitAction,
    ) -> Result<SellFill> {
        let shares = action.shares(position.shares);
        if shares <= Decimal::ZERO || shares > position.shares {
            return Err(EngineError::inconsistent("exit shares", shares));
        }

        let order = SellOrder {
            position_id: position.id,
            instrument_id: position.instrument_id.clone(),
            market: position.market.clone(),
            shares,
            entry_price: position.entry_price,
            reference_price: price,
            slippage: action.slippage,
            max_slippage: self.config.slippage_fraction(action.slippage),
        };

        self.limiter.wait_for_slot(Priority::High).await;
        let fill = match self.gateway.sell(&order).await {
            Ok(fill) => {
                self.limiter.report_success().await;
                fill
            }
            Err(e) => {
                if matches!(e, EngineError::RateLimited) {
                    self.limiter.report_rate_limit().await;
                }
                error!(
                    position_id = position.id,
                    reason = %action.reason,
                    shares = %shares,
                    error = %e,
                    "Exit order failed, position left unchanged"
                );
                return Err(e);
            }
        };

        if action.is_full() {
            let status = action.reason.terminal_status();
            if !self.store.close(position.id, status, fill.realized_pnl).await? {
                warn!(position_id = position.id, "Position was closed concurrently");
            }
        } else {
            let exit = PartialExit {
                shares_sold: shares,
                realized_pnl: fill.realized_pnl,
                mark: action.mark,
                terminal_status: action.reason.terminal_status(),
            };
            match self.store.apply_partial_exit(position.id, &exit).await? {
                PartialExitOutcome::Reduced { remaining } => {
                    info!(
                        position_id = position.id,
                        reason = %action.reason,
                        sold = %shares,
                        remaining = %remaining,
                        realized_pnl = %fill.realized_pnl,
                        "Partial exit filled"
                    );
                }
                PartialExitOutcome::Closed(status) => {
                    info!(position_id = position.id, status = %status, "Partial exit left dust, position closed");
                }
                PartialExitOutcome::NotOpen => {
                    warn!(position_id = position.id, "Position was closed concurrently");
                }
            }
        }

        Ok(fill)
    }
}
