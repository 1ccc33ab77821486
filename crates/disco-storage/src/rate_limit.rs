//! Per-source outbound call throttling.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use disco_core::RateLimitConfig;
use tokio::sync::Mutex;
use tokio::time::{sleep, sleep_until, Instant};

#[async_trait]
pub trait RateLimiter: Send + Sync + fmt::Debug {
    /// Waits until the next outbound call is allowed.
    async fn acquire(&self);
}

/// Spaces calls at least `interval` apart. The first call goes through immediately.
#[derive(Debug)]
pub struct FixedDelayLimiter {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl FixedDelayLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }
}

#[async_trait]
impl RateLimiter for FixedDelayLimiter {
    async fn acquire(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(at) if at > now => at,
                _ => now,
            };
            *next = Some(slot + self.interval);
            slot
        };
        sleep_until(slot).await;
    }
}

#[derive(Debug)]
pub struct TokenBucketLimiter {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucketLimiter {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn acquire(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if self.refill_every.is_zero() {
                return;
            }
            if elapsed >= self.refill_every {
                let refills = u32::try_from(elapsed.as_nanos() / self.refill_every.as_nanos())
                    .unwrap_or(u32::MAX);
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                if state.tokens == self.capacity {
                    state.last_refill = Instant::now();
                } else {
                    // Keep the fractional remainder so the steady-state rate holds.
                    state.last_refill += self.refill_every * refills;
                }
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every.saturating_sub(state.last_refill.elapsed());
            drop(state);
            sleep(sleep_for).await;
        }
    }
}

/// Fixed delay by default; token bucket when the config declares a burst.
pub fn build_limiter(config: &RateLimitConfig) -> Arc<dyn RateLimiter> {
    match config.burst {
        Some(burst) if burst > 1 => Arc::new(TokenBucketLimiter::new(burst, config.interval())),
        _ => Arc::new(FixedDelayLimiter::new(config.interval())),
    }
}

/// One limiter per source id, shared by every job of that source.
#[derive(Debug, Default)]
pub struct RateLimiters {
    limiters: Mutex<HashMap<String, Arc<dyn RateLimiter>>>,
}

impl RateLimiters {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn for_source(&self, source_id: &str, config: &RateLimitConfig) -> Arc<dyn RateLimiter> {
        let mut map = self.limiters.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| build_limiter(config))
            .clone()
    }
}
