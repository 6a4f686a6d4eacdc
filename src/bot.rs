//! Supervisor: wires the shared rate limiter, price cache and gateways into the
//! risk engine and signal detector, runs both loops, and stops them together.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::{
    ClobCredentials, ClobGateway, DataClient, ExecutionGateway, OrderBookClient, PaperGateway,
};
use crate::db::PositionStore;
use crate::models::Signal;
use crate::throttle::{CacheStats, PriceCache, RateLimitStats, RateLimiter};
use crate::trading::{EngineConfig, EngineHealth, RiskEngine, SignalDetector};

/// Capacity of the signal channel between the detector and its consumer.
const SIGNAL_BUFFER: usize = 256;

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub engine: EngineConfig,

    /// Simulate sells instead of posting orders
    pub dry_run: bool,

    pub database_url: String,
}

/// Owns the shared components. One instance per process.
pub struct Bot {
    config: BotConfig,
    store: PositionStore,
    limiter: Arc<RateLimiter>,
    prices: Arc<PriceCache>,
    risk: Arc<RiskEngine>,
    live: bool,
}

impl Bot {
    pub async fn new(config: BotConfig) -> Result<Self> {
        let store = PositionStore::connect(&config.database_url).await?;
        let limiter = Arc::new(RateLimiter::new(&config.engine.limiter));
        let book = OrderBookClient::new()?;

        // Fall back to paper fills when live trading is not configured.
        let (gateway, live): (Arc<dyn ExecutionGateway>, bool) = if config.dry_run {
            (Arc::new(PaperGateway::new(book)), false)
        } else {
            match ClobCredentials::from_env().and_then(|c| ClobGateway::new(book.clone(), c)) {
                Ok(gateway) => {
                    info!(address = ?gateway.address(), "CLOB gateway initialized");
                    (Arc::new(gateway), true)
                }
                Err(e) => {
                    warn!("CLOB gateway not configured: {}. Running in dry-run mode.", e);
                    (Arc::new(PaperGateway::new(book)), false)
                }
            }
        };

        let prices = Arc::new(PriceCache::new(
            gateway.clone(),
            limiter.clone(),
            &config.engine.cache,
        ));
        let risk = Arc::new(RiskEngine::new(
            store.clone(),
            prices.clone(),
            gateway,
            limiter.clone(),
            config.engine.risk.clone(),
        ));

        Ok(Self {
            config,
            store,
            limiter,
            prices,
            risk,
            live,
        })
    }

    pub fn risk_engine(&self) -> &RiskEngine {
        &self.risk
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Retune the shared request interval, e.g. after a provider plan change.
    pub async fn set_request_interval(&self, interval: Duration) {
        self.limiter.set_min_interval(interval).await;
    }

    /// Run both loops until Ctrl+C, then drain and report.
    pub async fn run(&self) -> Result<BotStats> {
        self.store.ping().await.context("Position store unreachable")?;

        let token = CancellationToken::new();
        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);

        let ledger = Arc::new(DataClient::new()?);
        let detector = SignalDetector::new(
            ledger,
            self.limiter.clone(),
            self.prices.clone(),
            self.config.engine.detector.clone(),
            tx,
        );

        let wallets = self
            .store
            .tracked_wallets()
            .await
            .context("Failed to load tracked wallets")?;
        for wallet in &wallets {
            if !detector.add_wallet(wallet).await {
                warn!(wallet = %wallet, "Wallet not followed (duplicate or limit reached)");
            }
        }
        info!(
            wallets = wallets.len(),
            live = self.live,
            "Supervisor starting"
        );

        let consumer = tokio::spawn(consume_signals(rx));

        let risk = self.risk.clone();
        let risk_token = token.clone();
        let risk_task = tokio::spawn(async move { risk.run(risk_token).await });

        let detector_token = token.clone();
        let detector_task = tokio::spawn(async move { detector.run(detector_token).await });

        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C, shutting down"),
        }
        token.cancel();

        let (risk_result, detector_result) = tokio::join!(risk_task, detector_task);
        if let Err(e) = risk_result {
            error!(error = %e, "Risk engine task failed");
        }
        if let Err(e) = detector_result {
            error!(error = %e, "Signal detector task failed");
        }

        // The detector owned the only sender, so the consumer drains and exits.
        let signals = consumer.await.unwrap_or_default();

        Ok(self.stats(signals).await)
    }

    pub async fn stats(&self, signals_seen: u64) -> BotStats {
        BotStats {
            health: self.risk.health().read().await.clone(),
            limiter: self.limiter.stats().await,
            cache: self.prices.stats(),
            signals_seen,
            live: self.live,
        }
    }
}

/// Hand-off point for the entry flow. Signals are logged here.
async fn consume_signals(mut rx: mpsc::Receiver<Signal>) -> u64 {
    let mut seen = 0;
    while let Some(signal) = rx.recv().await {
        seen += 1;
        let usd = signal
            .usd_value
            .map(|v| format!("{:.2}", v))
            .unwrap_or_else(|| "unpriced".to_string());
        info!(
            id = %signal.id,
            wallet = %signal.wallet,
            instrument = %signal.instrument_id,
            side = %signal.side,
            delta = %signal.size_delta,
            balance = %signal.new_balance,
            usd = %usd,
            "Signal"
        );
    }
    seen
}

/// Final report printed on shutdown.
#[derive(Debug, Clone)]
pub struct BotStats {
    pub health: EngineHealth,
    pub limiter: RateLimitStats,
    pub cache: CacheStats,
    pub signals_seen: u64,
    pub live: bool,
}

impl fmt::Display for BotStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Engine Health ===")?;
        writeln!(f, "Store:            {}", if self.health.store_ok { "OK" } else { "DOWN" })?;
        writeln!(f, "Gateway:          {}", if self.health.gateway_ok { "OK" } else { "DOWN" })?;
        writeln!(f, "Risk Cycles:      {}", self.health.cycles)?;
        writeln!(
            f,
            "Last Cycle:       {}",
            self.health
                .last_cycle_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "Never".to_string())
        )?;
        writeln!(f, "Failure Streak:   {}", self.health.consecutive_failures)?;
        writeln!(f, "Signals Seen:     {}", self.signals_seen)?;

        writeln!(f, "\n=== Rate Limiter ===")?;
        writeln!(f, "Requests:         {}", self.limiter.total_requests)?;
        writeln!(f, "Rate Limited:     {}", self.limiter.rate_limited_requests)?;
        writeln!(f, "Backoff Events:   {}", self.limiter.backoff_events)?;
        writeln!(f, "Current Backoff:  {:?}", self.limiter.current_backoff)?;

        writeln!(f, "\n=== Price Cache ===")?;
        writeln!(f, "Hits / Misses:    {} / {}", self.cache.hits, self.cache.misses)?;
        writeln!(f, "Entries:          {}", self.cache.entries)?;

        write!(f, "\nMode:             {}", if self.live { "LIVE" } else { "DRY RUN" })
    }
}
