//! Engine configuration.
//!
//! Defaults mirror the production settings; any field can be overridden from
//! the environment (a `.env` file is loaded by `main` before this runs).

use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::trading::SlippageClass;

/// Configuration for the risk and exit loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Target cycle length in milliseconds
    pub interval_ms: u64,

    /// Minimum sleep between cycles, even when a cycle overruns
    pub min_sleep_ms: u64,

    /// Price tolerance for stop-loss and trailing exits (percent)
    pub aggressive_slippage_pct: Decimal,

    /// Price tolerance for profit-taking exits (percent)
    pub conservative_slippage_pct: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            min_sleep_ms: 100,
            aggressive_slippage_pct: dec!(1.0),
            conservative_slippage_pct: dec!(0.2),
        }
    }
}

impl RiskConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn min_sleep(&self) -> Duration {
        Duration::from_millis(self.min_sleep_ms)
    }

    /// Slippage tolerance as a fraction (0.01 = 1%).
    pub fn slippage_fraction(&self, class: SlippageClass) -> Decimal {
        let pct = match class {
            SlippageClass::Aggressive => self.aggressive_slippage_pct,
            SlippageClass::Conservative => self.conservative_slippage_pct,
        };
        pct / Decimal::ONE_HUNDRED
    }
}

/// Configuration for the wallet signal detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Target poll cycle length in milliseconds
    pub interval_ms: u64,

    /// Balance changes worth less than this (USDC) are noise
    pub min_signal_usd: Decimal,

    /// Upper bound on tracked wallets
    pub max_wallets: usize,

    /// Upper bound on concurrent wallet fetches
    pub max_workers: usize,

    /// Extra time granted to a fetch beyond one interval
    pub timeout_margin_ms: u64,

    /// How many emitted signal IDs to remember
    pub dedup_window: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2_000,
            min_signal_usd: dec!(1),
            max_wallets: 50,
            max_workers: 10,
            timeout_margin_ms: 1_000,
            dedup_window: 1_000,
        }
    }
}

impl DetectorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Per-wallet fetch timeout: one interval plus margin.
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.interval_ms + self.timeout_margin_ms)
    }

    /// Worker pool size for a given number of wallets.
    pub fn worker_count(&self, wallet_count: usize) -> usize {
        self.max_workers.min(wallet_count + 1).max(1)
    }
}

/// Configuration for the shared upstream rate limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    pub min_interval_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 200,   // 5 requests/second
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
        }
    }
}

/// TTLs for the two price consumption classes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub metadata_ttl_ms: u64,
    pub risk_ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            metadata_ttl_ms: 30_000,
            risk_ttl_ms: 800,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub risk: RiskConfig,
    pub detector: DetectorConfig,
    pub limiter: LimiterConfig,
    pub cache: CacheConfig,
}

impl EngineConfig {
    /// Defaults overridden by `POLYGUARD_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        override_from_env(&mut config.risk.interval_ms, "POLYGUARD_RISK_INTERVAL_MS");
        override_from_env(&mut config.risk.min_sleep_ms, "POLYGUARD_RISK_MIN_SLEEP_MS");
        override_from_env(
            &mut config.risk.aggressive_slippage_pct,
            "POLYGUARD_AGGRESSIVE_SLIPPAGE_PCT",
        );
        override_from_env(
            &mut config.risk.conservative_slippage_pct,
            "POLYGUARD_CONSERVATIVE_SLIPPAGE_PCT",
        );

        override_from_env(&mut config.detector.interval_ms, "POLYGUARD_DETECTOR_INTERVAL_MS");
        override_from_env(&mut config.detector.min_signal_usd, "POLYGUARD_MIN_SIGNAL_USD");
        override_from_env(&mut config.detector.max_wallets, "POLYGUARD_MAX_WALLETS");
        override_from_env(&mut config.detector.max_workers, "POLYGUARD_MAX_WORKERS");
        override_from_env(&mut config.detector.dedup_window, "POLYGUARD_DEDUP_WINDOW");

        override_from_env(&mut config.limiter.min_interval_ms, "POLYGUARD_MIN_REQUEST_INTERVAL_MS");
        override_from_env(&mut config.limiter.backoff_base_ms, "POLYGUARD_BACKOFF_BASE_MS");
        override_from_env(&mut config.limiter.backoff_max_ms, "POLYGUARD_BACKOFF_MAX_MS");

        override_from_env(&mut config.cache.metadata_ttl_ms, "POLYGUARD_METADATA_TTL_MS");
        override_from_env(&mut config.cache.risk_ttl_ms, "POLYGUARD_RISK_TTL_MS");

        config
    }
}

fn override_from_env<T: FromStr>(field: &mut T, key: &str) {
    if let Some(value) = std::env::var(key).ok().and_then(|v| v.parse().ok()) {
        *field = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_count_bounds() {
        let config = DetectorConfig::default();
        assert_eq!(config.worker_count(0), 1);
        assert_eq!(config.worker_count(3), 4);
        assert_eq!(config.worker_count(40), 10);
    }

    #[test]
    fn test_fetch_timeout_exceeds_interval() {
        let config = DetectorConfig::default();
        assert!(config.fetch_timeout() > config.interval());
    }

    #[test]
    fn test_slippage_fraction() {
        let config = RiskConfig::default();
        assert_eq!(config.slippage_fraction(SlippageClass::Aggressive), dec!(0.01));
        assert_eq!(config.slippage_fraction(SlippageClass::Conservative), dec!(0.002));
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("POLYGUARD_TEST_ONLY_KEY", "250");
        let mut value = 10u64;
        override_from_env(&mut value, "POLYGUARD_TEST_ONLY_KEY");
        assert_eq!(value, 250);

        std::env::set_var("POLYGUARD_TEST_ONLY_KEY", "not-a-number");
        override_from_env(&mut value, "POLYGUARD_TEST_ONLY_KEY");
        assert_eq!(value, 250);
    }
}
