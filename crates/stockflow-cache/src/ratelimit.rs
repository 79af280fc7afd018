use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use stockflow_core::config::RateLimitConfig;
use stockflow_core::error::{Result, StockflowError};

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    cooldown_until: Option<Instant>,
}

struct Source {
    capacity: f64,
    refill_per_sec: f64,
    cooldown: Duration,
    max_wait: Duration,
    bucket: Mutex<Bucket>,
}

/// Process-wide token buckets, one per external source, shared by all
/// concurrent runs.
///
/// `acquire` suspends the caller until a token is available or the source's
/// max-wait elapses, at which point it fails with `RateLimitExceeded` and
/// the source enters its cooldown (further acquires fail fast until it
/// lapses). Bucket state is updated under a per-source lock that is never
/// held across an await.
pub struct RateLimiter {
    sources: HashMap<String, Source>,
}

enum Gate {
    Granted,
    Wait(Duration),
    Exhausted,
}

impl RateLimiter {
    pub fn new(policies: &HashMap<String, RateLimitConfig>) -> Self {
        let now = Instant::now();
        let sources = policies
            .iter()
            .map(|(id, cfg)| {
                let capacity = cfg.requests_per_minute as f64;
                (
                    id.clone(),
                    Source {
                        capacity,
                        refill_per_sec: capacity / 60.0,
                        cooldown: Duration::from_secs(cfg.cooldown_secs),
                        max_wait: Duration::from_secs(cfg.max_wait_secs),
                        bucket: Mutex::new(Bucket {
                            tokens: capacity,
                            last_refill: now,
                            cooldown_until: None,
                        }),
                    },
                )
            })
            .collect();
        Self { sources }
    }

    /// Take one token from the source's bucket, waiting up to the source's
    /// configured max-wait.
    pub async fn acquire(&self, source: &str) -> Result<()> {
        let Some(src) = self.sources.get(source) else {
            // Sources without a policy are not budget-bound.
            debug!(source, "no rate limit policy configured, allowing");
            return Ok(());
        };

        let deadline = Instant::now() + src.max_wait;
        loop {
            let gate = src.check(deadline);
            match gate {
                Gate::Granted => return Ok(()),
                Gate::Wait(delay) => tokio::time::sleep(delay).await,
                Gate::Exhausted => {
                    warn!(source, max_wait_secs = src.max_wait.as_secs(), "rate limit exhausted");
                    return Err(StockflowError::RateLimitExceeded(source.to_string()));
                }
            }
        }
    }

    /// Tokens currently available for a source, after refill. Intended for
    /// status output; None for unconfigured sources.
    pub fn available(&self, source: &str) -> Option<u32> {
        let src = self.sources.get(source)?;
        let mut bucket = src.bucket.lock().expect("rate bucket poisoned");
        src.refill(&mut bucket, Instant::now());
        Some(bucket.tokens as u32)
    }
}

impl Source {
    fn check(&self, deadline: Instant) -> Gate {
        let now = Instant::now();
        let mut bucket = self.bucket.lock().expect("rate bucket poisoned");

        if let Some(until) = bucket.cooldown_until {
            if now < until {
                if until > deadline {
                    return Gate::Exhausted;
                }
                return Gate::Wait(until - now);
            }
            bucket.cooldown_until = None;
        }

        self.refill(&mut bucket, now);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Gate::Granted;
        }

        // Time until one full token accrues.
        let deficit = 1.0 - bucket.tokens;
        let wait = Duration::from_secs_f64(deficit / self.refill_per_sec);
        if now + wait > deadline {
            bucket.cooldown_until = Some(now + self.cooldown);
            return Gate::Exhausted;
        }
        Gate::Wait(wait)
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(rpm: u32, cooldown_secs: u64, max_wait_secs: u64) -> RateLimiter {
        let mut policies = HashMap::new();
        policies.insert(
            "stock_api".to_string(),
            RateLimitConfig {
                requests_per_minute: rpm,
                cooldown_secs,
                max_wait_secs,
            },
        );
        RateLimiter::new(&policies)
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_never_exceeds_capacity() {
        // Scenario: capacity 30/minute; the 31st request in the same window
        // is delayed until refill, never granted immediately.
        let rl = limiter(30, 60, 30);

        for _ in 0..30 {
            rl.acquire("stock_api").await.unwrap();
        }

        let start = Instant::now();
        rl.acquire("stock_api").await.unwrap();
        // One token accrues every 2 seconds at 30/minute.
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_past_max_wait_fails() {
        let rl = limiter(30, 60, 1);

        for _ in 0..30 {
            rl.acquire("stock_api").await.unwrap();
        }
        // Refill needs 2s per token but max wait is 1s.
        let err = rl.acquire("stock_api").await.unwrap_err();
        assert!(matches!(err, StockflowError::RateLimitExceeded(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_fails_fast_then_lapses() {
        let rl = limiter(30, 60, 1);
        for _ in 0..30 {
            rl.acquire("stock_api").await.unwrap();
        }
        assert!(rl.acquire("stock_api").await.is_err());

        // Source is cooling down: even though a token would accrue in 2s,
        // the 60s cooldown exceeds the 1s max wait.
        tokio::time::advance(Duration::from_secs(5)).await;
        let start = Instant::now();
        assert!(rl.acquire("stock_api").await.is_err());
        assert_eq!(start.elapsed(), Duration::ZERO);

        // After the cooldown lapses the bucket has refilled.
        tokio::time::advance(Duration::from_secs(60)).await;
        rl.acquire("stock_api").await.unwrap();
    }

    #[tokio::test]
    async fn test_unconfigured_source_is_not_limited() {
        let rl = limiter(1, 60, 0);
        for _ in 0..10 {
            rl.acquire("unthrottled").await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_never_exceed_capacity() {
        let rl = limiter(30, 60, 30);
        tokio::time::advance(Duration::from_secs(600)).await;
        assert_eq!(rl.available("stock_api"), Some(30));
    }
}
