//! Upstream request throttling: shared rate limiter, price cache and loop pacing.

mod pacer;
mod price_cache;
mod rate_limiter;

pub use pacer::Pacer;
pub use price_cache::{CacheStats, PriceCache, TtlClass};
pub use rate_limiter::{Priority, RateLimitStats, RateLimiter};
