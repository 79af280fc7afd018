pub mod cache;
pub mod ratelimit;

pub use cache::{CacheKey, CacheManager, TtlPolicy};
pub use ratelimit::RateLimiter;
