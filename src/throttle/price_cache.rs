//! Short-TTL price cache in front of the rate limiter.
//!
//! Each (instrument, side) key owns an async mutex. A caller that misses holds
//! that mutex across the fetch, so concurrent misses on the same key wait for
//! the first fetch and then read its result instead of hitting upstream again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::api::ExecutionGateway;
use crate::error::{EngineError, Result};
use crate::models::Side;
use crate::trading::CacheConfig;

use super::{Priority, RateLimiter};

/// Consumption class, which decides how stale a cached price may be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlClass {
    /// Descriptive data for the signal detector (tens of seconds)
    Metadata,
    /// The exit loop (sub-second)
    Risk,
}

#[derive(Debug, Clone, Copy)]
struct CachedQuote {
    price: Decimal,
    fetched_at: Instant,
}

type Slot = Arc<Mutex<Option<CachedQuote>>>;

/// Cache hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Thread-safe price cache shared by the risk engine and the signal detector.
pub struct PriceCache {
    entries: DashMap<(String, Side), Slot>,
    source: Arc<dyn ExecutionGateway>,
    limiter: Arc<RateLimiter>,
    metadata_ttl: Duration,
    risk_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PriceCache {
    pub fn new(
        source: Arc<dyn ExecutionGateway>,
        limiter: Arc<RateLimiter>,
        config: &CacheConfig,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            source,
            limiter,
            metadata_ttl: Duration::from_millis(config.metadata_ttl_ms),
            risk_ttl: Duration::from_millis(config.risk_ttl_ms),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn ttl(&self, class: TtlClass) -> Duration {
        match class {
            TtlClass::Metadata => self.metadata_ttl,
            TtlClass::Risk => self.risk_ttl,
        }
    }

    /// Get a price, fetching through the rate limiter when the cached one is too old.
    pub async fn get(&self, instrument_id: &str, side: Side, class: TtlClass) -> Result<Option<Decimal>> {
        let slot = self
            .entries
            .entry((instrument_id.to_string(), side))
            .or_default()
            .value()
            .clone();

        let mut cached = slot.lock().await;
        if let Some(quote) = cached.as_ref() {
            if quote.fetched_at.elapsed() < self.ttl(class) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(quote.price));
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let priority = match class {
            TtlClass::Risk => Priority::High,
            TtlClass::Metadata => Priority::Low,
        };
        self.limiter.wait_for_slot(priority).await;

        match self.source.get_price(instrument_id, side).await {
            Ok(Some(price)) => {
                self.limiter.report_success().await;
                *cached = Some(CachedQuote {
                    price,
                    fetched_at: Instant::now(),
                });
                Ok(Some(price))
            }
            Ok(None) => {
                self.limiter.report_success().await;
                debug!(instrument = %instrument_id, side = %side, "No price available");
                Ok(None)
            }
            Err(EngineError::RateLimited) => {
                self.limiter.report_rate_limit().await;
                Err(EngineError::RateLimited)
            }
            Err(e) => Err(e),
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }
}
