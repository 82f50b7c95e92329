// Token bucket shared by every request of an SdApi
//
// One token is refilled per interval up to a small burst capacity. Callers
// wait for a token before each HTTP attempt, retries included.

use crate::error::{EpgError, Result};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Configuration for the request rate limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Time needed to refill one token
    pub refill_interval: Duration,
    /// Maximum number of tokens kept in the bucket
    pub capacity: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            refill_interval: Duration::from_millis(100),
            capacity: 5,
        }
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct TokenBucket {
    config: RateLimitConfig,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Starts with a full bucket
    pub fn new(config: RateLimitConfig) -> Self {
        let config = RateLimitConfig {
            capacity: config.capacity.max(1),
            ..config
        };
        Self {
            state: Mutex::new(BucketState {
                tokens: config.capacity as f64,
                last_refill: Instant::now(),
            }),
            config,
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        if self.config.refill_interval.is_zero() {
            state.tokens = self.config.capacity as f64;
            state.last_refill = now;
            return;
        }
        let elapsed = now.saturating_duration_since(state.last_refill);
        let gained = elapsed.as_secs_f64() / self.config.refill_interval.as_secs_f64();
        state.tokens = (state.tokens + gained).min(self.config.capacity as f64);
        state.last_refill = now;
    }

    /// Waits until a token is available, or fails with `Cancelled`
    ///
    /// ```
    /// use pmoepg::api::rate_limit::{RateLimitConfig, TokenBucket};
    /// use tokio_util::sync::CancellationToken;
    ///
    /// # tokio_test::block_on(async {
    /// let bucket = TokenBucket::new(RateLimitConfig::default());
    /// let cancel = CancellationToken::new();
    /// for _ in 0..5 {
    ///     bucket.acquire(&cancel).await?;
    /// }
    ///
    /// cancel.cancel();
    /// assert!(bucket.acquire(&cancel).await.is_err());
    /// # Ok::<(), pmoepg::EpgError>(())
    /// # }).unwrap();
    /// ```
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(EpgError::Cancelled);
            }

            let wait = {
                let mut state = self.state.lock().await;
                self.refill(&mut state, Instant::now());
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return Ok(());
                }
                self.config
                    .refill_interval
                    .mul_f64(1.0 - state.tokens)
            };

            trace!("Rate limit reached, waiting {:?}", wait);
            tokio::select! {
                _ = cancel.cancelled() => return Err(EpgError::Cancelled),
                _ = sleep(wait) => {}
            }
        }
    }
}
