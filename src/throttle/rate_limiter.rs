//! Shared gate for every outbound call to the data and trading provider.
//!
//! One instance is built at startup and handed to the risk engine, the price
//! cache and the signal detector as an `Arc<RateLimiter>`. The mutex only
//! covers the timing decision: a caller reserves its slot under the lock and
//! sleeps after releasing it, so the I/O itself is never serialized.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::trading::LimiterConfig;

/// Lowest accepted minimum interval when reconfigured at runtime.
const MIN_INTERVAL_FLOOR: Duration = Duration::from_millis(100);

/// Request priority. High priority callers wait half of the computed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Risk loop: exits need minimal latency
    High,
    /// Signal detection can afford to wait
    Low,
}

/// Limiter counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitStats {
    pub total_requests: u64,
    pub rate_limited_requests: u64,
    pub backoff_events: u64,
    pub current_delay: Duration,
    pub current_backoff: Duration,
    pub min_interval: Duration,
}

#[derive(Debug)]
struct LimiterState {
    /// Time the most recently granted slot became (or becomes) usable
    last_slot: Option<Instant>,
    min_interval: Duration,
    current_backoff: Duration,
    backoff_until: Option<Instant>,
    stats: RateLimitStats,
}

/// Coordinated rate limiter with priority classes and decaying exponential backoff.
pub struct RateLimiter {
    state: Mutex<LimiterState>,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl RateLimiter {
    /// Create a limiter from configuration.
    pub fn new(config: &LimiterConfig) -> Self {
        let min_interval = Duration::from_millis(config.min_interval_ms);
        info!(min_interval_ms = config.min_interval_ms, "Rate limiter initialized");

        Self {
            state: Mutex::new(LimiterState {
                last_slot: None,
                min_interval,
                current_backoff: Duration::ZERO,
                backoff_until: None,
                stats: RateLimitStats::default(),
            }),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// Wait until a request may be issued. Returns how long the caller waited.
    pub async fn wait_for_slot(&self, priority: Priority) -> Duration {
        let wait = {
            let mut state = self.state.lock().await;
            state.stats.total_requests += 1;
            let now = Instant::now();

            let spacing = match state.last_slot {
                Some(last) => (last + state.min_interval).saturating_duration_since(now),
                None => Duration::ZERO,
            };
            let backoff = match state.backoff_until {
                Some(until) if now < until => {
                    state.stats.rate_limited_requests += 1;
                    until - now
                }
                _ => Duration::ZERO,
            };
            let mut wait = spacing.max(backoff);

            if priority == Priority::High {
                wait /= 2;
            }

            state.last_slot = Some(now + wait);
            state.stats.current_delay = wait;
            wait
        };

        if !wait.is_zero() {
            debug!(wait_ms = wait.as_millis() as u64, ?priority, "Waiting for rate limit slot");
            sleep(wait).await;
        }

        wait
    }

    /// Record a 429 from upstream. Backoff starts at the base and doubles up to the cap.
    pub async fn report_rate_limit(&self) {
        let mut state = self.state.lock().await;
        state.stats.backoff_events += 1;

        state.current_backoff = if state.current_backoff.is_zero() {
            self.backoff_base
        } else {
            (state.current_backoff * 2).min(self.backoff_max)
        };
        state.backoff_until = Some(Instant::now() + state.current_backoff);

        warn!(
            backoff_ms = state.current_backoff.as_millis() as u64,
            events = state.stats.backoff_events,
            "Upstream rate limit hit, backing off"
        );
    }

    /// Record a successful request. Backoff decays by 25% and clears below the base.
    pub async fn report_success(&self) {
        let mut state = self.state.lock().await;
        if state.current_backoff.is_zero() {
            return;
        }

        state.current_backoff = state.current_backoff.mul_f64(0.75);
        if state.current_backoff < self.backoff_base {
            state.current_backoff = Duration::ZERO;
            debug!("Rate limit backoff cleared");
        }
    }

    /// Change the minimum interval between requests (floored at 100ms).
    pub async fn set_min_interval(&self, interval: Duration) {
        let mut state = self.state.lock().await;
        state.min_interval = interval.max(MIN_INTERVAL_FLOOR);
        info!(
            min_interval_ms = state.min_interval.as_millis() as u64,
            "Rate limiter interval updated"
        );
    }

    /// Snapshot of the limiter counters.
    pub async fn stats(&self) -> RateLimitStats {
        let state = self.state.lock().await;
        RateLimitStats {
            current_backoff: state.current_backoff,
            min_interval: state.min_interval,
            ..state.stats.clone()
        }
    }

    /// Current backoff step (zero when not backing off).
    pub async fn current_backoff(&self) -> Duration {
        self.state.lock().await.current_backoff
    }
}
