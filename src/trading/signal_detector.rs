//! Wallet signal detector.
//!
//! Polls a bounded set of followed wallets through the shared rate limiter,
//! diffs each snapshot against the previous one and emits BUY/SELL signals on
//! an mpsc channel. The first snapshot of a wallet is only a baseline.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::LedgerProvider;
use crate::error::{EngineError, Result};
use crate::models::{Side, Signal};
use crate::throttle::{Pacer, PriceCache, Priority, RateLimiter, TtlClass};

use super::DetectorConfig;

type Snapshot = HashMap<String, Decimal>;

/// Rolling window of recently emitted signal IDs.
#[derive(Debug)]
struct DedupWindow {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl DedupWindow {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Returns `false` if `id` is already in the window.
    fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }
}

/// A balance transition before valuation and filtering.
#[derive(Debug, Clone, PartialEq)]
struct BalanceChange {
    instrument_id: String,
    side: Side,
    old_balance: Decimal,
    new_balance: Decimal,
}

impl BalanceChange {
    fn delta(&self) -> Decimal {
        (self.new_balance - self.old_balance).abs()
    }
}

/// Diff two snapshots. Instruments missing on one side count as zero.
fn diff_snapshots(old: &Snapshot, new: &Snapshot) -> Vec<BalanceChange> {
    let instruments: BTreeSet<&String> = old.keys().chain(new.keys()).collect();

    instruments
        .into_iter()
        .filter_map(|instrument| {
            let before = old.get(instrument).copied().unwrap_or(Decimal::ZERO);
            let after = new.get(instrument).copied().unwrap_or(Decimal::ZERO);
            let side = if after > before {
                Side::Buy
            } else if after < before {
                Side::Sell
            } else {
                return None;
            };
            Some(BalanceChange {
                instrument_id: instrument.clone(),
                side,
                old_balance: before,
                new_balance: after,
            })
        })
        .collect()
}

/// Counters for one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub wallets_polled: usize,
    pub failures: usize,
    pub rate_limited: usize,
    pub baselines: usize,
    pub signals: usize,
    pub below_noise_floor: usize,
    pub duplicates: usize,
}

pub struct SignalDetector {
    ledger: Arc<dyn LedgerProvider>,
    limiter: Arc<RateLimiter>,
    prices: Arc<PriceCache>,
    config: DetectorConfig,
    wallets: RwLock<Vec<String>>,
    snapshots: Mutex<HashMap<String, Snapshot>>,
    dedup: Mutex<DedupWindow>,
    /// Numbers every accepted snapshot, across all wallets
    sequence: AtomicU64,
    signals: mpsc::Sender<Signal>,
}

impl SignalDetector {
    pub fn new(
        ledger: Arc<dyn LedgerProvider>,
        limiter: Arc<RateLimiter>,
        prices: Arc<PriceCache>,
        config: DetectorConfig,
        signals: mpsc::Sender<Signal>,
    ) -> Self {
        Self {
            ledger,
            limiter,
            prices,
            dedup: Mutex::new(DedupWindow::new(config.dedup_window)),
            config,
            wallets: RwLock::new(Vec::new()),
            snapshots: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            signals,
        }
    }

    /// Start following a wallet. Returns `false` if already tracked or the set is full.
    pub async fn add_wallet(&self, address: &str) -> bool {
        let address = address.trim().to_lowercase();
        let mut wallets = self.wallets.write().await;

        if wallets.contains(&address) {
            return false;
        }
        if wallets.len() >= self.config.max_wallets {
            warn!(wallet = %address, max = self.config.max_wallets, "Wallet limit reached");
            return false;
        }

        info!(wallet = %address, "Tracking wallet");
        wallets.push(address);
        true
    }

    pub async fn wallets(&self) -> Vec<String> {
        self.wallets.read().await.clone()
    }

    /// Poll until `token` is cancelled.
    pub async fn run(&self, token: CancellationToken) {
        let pacer = Pacer::new(self.config.interval(), std::time::Duration::ZERO);
        info!(interval_ms = self.config.interval_ms, "Signal detector started");

        while !token.is_cancelled() {
            let started = Instant::now();
            let report = self.poll_once(&token).await;

            debug!(
                wallets = report.wallets_polled,
                signals = report.signals,
                failures = report.failures,
                rate_limited = report.rate_limited,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Poll cycle complete"
            );

            if !pacer.wait(started, &token).await {
                break;
            }
        }

        info!("Signal detector stopped");
    }

    /// Fetch every tracked wallet once and emit the resulting signals.
    pub async fn poll_once(&self, token: &CancellationToken) -> PollReport {
        let wallets = self.wallets().await;
        let workers = self.config.worker_count(wallets.len());
        let mut report = PollReport::default();

        let results: Vec<(String, Option<Result<Snapshot>>)> = stream::iter(wallets)
            .map(|wallet| async move {
                if token.is_cancelled() {
                    return (wallet, None);
                }
                let result = self.fetch_snapshot(&wallet).await;
                (wallet, Some(result))
            })
            .buffer_unordered(workers)
            .collect()
            .await;

        for (wallet, result) in results {
            let snapshot = match result {
                None => continue,
                Some(Ok(snapshot)) => snapshot,
                Some(Err(EngineError::RateLimited)) => {
                    report.rate_limited += 1;
                    continue;
                }
                Some(Err(e)) => {
                    report.failures += 1;
                    warn!(wallet = %wallet, error = %e, "Wallet fetch failed");
                    continue;
                }
            };
            report.wallets_polled += 1;

            let (changes, sequence) = {
                let mut snapshots = self.snapshots.lock().await;
                let changes = snapshots
                    .get(&wallet)
                    .map(|previous| diff_snapshots(previous, &snapshot));
                snapshots.insert(wallet.clone(), snapshot);
                (changes, self.sequence.fetch_add(1, Ordering::Relaxed))
            };

            let Some(changes) = changes else {
                report.baselines += 1;
                debug!(wallet = %wallet, "Baseline snapshot recorded");
                continue;
            };

            for change in changes {
                self.emit(&wallet, sequence, change, &mut report).await;
            }
        }

        report
    }

    async fn fetch_snapshot(&self, wallet: &str) -> Result<Snapshot> {
        self.limiter.wait_for_slot(Priority::Low).await;

        match timeout(self.config.fetch_timeout(), self.ledger.get_wallet_positions(wallet)).await {
            Err(_) => Err(EngineError::Provider(format!(
                "timed out after {}ms",
                self.config.fetch_timeout().as_millis()
            ))),
            Ok(Err(EngineError::RateLimited)) => {
                self.limiter.report_rate_limit().await;
                Err(EngineError::RateLimited)
            }
            Ok(Err(e)) => Err(e),
            Ok(Ok(snapshot)) => {
                self.limiter.report_success().await;
                Ok(snapshot)
            }
        }
    }

    async fn emit(
        &self,
        wallet: &str,
        sequence: u64,
        change: BalanceChange,
        report: &mut PollReport,
    ) {
        let delta = change.delta();

        let usd_value = match self
            .prices
            .get(&change.instrument_id, change.side, TtlClass::Metadata)
            .await
        {
            Ok(price) => price.map(|p| p * delta),
            Err(e) => {
                debug!(instrument = %change.instrument_id, error = %e, "No valuation for signal");
                None
            }
        };

        if let Some(value) = usd_value {
            if value < self.config.min_signal_usd {
                report.below_noise_floor += 1;
                return;
            }
        }

        let id = Signal::key(wallet, &change.instrument_id, change.side, sequence);
        if !self.dedup.lock().await.insert(&id) {
            report.duplicates += 1;
            return;
        }

        let signal = Signal {
            id,
            wallet: wallet.to_string(),
            instrument_id: change.instrument_id,
            side: change.side,
            size_delta: delta,
            new_balance: change.new_balance,
            usd_value,
            detected_at: Utc::now(),
        };

        info!(
            wallet = %signal.wallet,
            instrument = %signal.instrument_id,
            side = %signal.side,
            delta = %signal.size_delta,
            "Signal detected"
        );

        if self.signals.send(signal).await.is_err() {
            warn!("Signal receiver dropped");
            return;
        }
        report.signals += 1;
    }
}
