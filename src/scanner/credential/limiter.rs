use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, AppResult};

/// Rate bounds for the adaptive adjustment, in requests per minute.
pub const MIN_RATE_PER_MINUTE: f64 = 10.0;
pub const MAX_RATE_PER_MINUTE: f64 = 50.0;

struct Bucket {
    tokens: f64,
    capacity: f64,
    rate_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.last_refill = now;
    }
}

/// Token bucket with a mutable rate. Each credential owns one; the pool
/// adjusts the rate from observed success rates.
pub struct RateLimiter {
    inner: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(per_minute: f64, burst: u32) -> Self {
        let capacity = (burst.max(1)) as f64;
        Self {
            inner: Mutex::new(Bucket {
                tokens: capacity,
                capacity,
                rate_per_sec: per_minute / 60.0,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn rate_per_minute(&self) -> f64 {
        self.inner.lock().rate_per_sec * 60.0
    }

    /// Sets a new rate, clamped to `[MIN_RATE_PER_MINUTE, MAX_RATE_PER_MINUTE]`.
    /// Returns the effective rate.
    pub fn set_rate_per_minute(&self, per_minute: f64) -> f64 {
        let clamped = per_minute.clamp(MIN_RATE_PER_MINUTE, MAX_RATE_PER_MINUTE);
        let mut bucket = self.inner.lock();
        let now = Instant::now();
        bucket.refill(now);
        bucket.rate_per_sec = clamped / 60.0;
        clamped
    }

    /// Takes one request slot, or reports how long until one is available.
    fn try_acquire(&self) -> Result<(), Duration> {
        let mut bucket = self.inner.lock();
        let now = Instant::now();
        bucket.refill(now);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - bucket.tokens;
            Err(Duration::from_secs_f64(deficit / bucket.rate_per_sec))
        }
    }

    /// Blocks until a request slot is available. Returns `Cancelled` as soon
    /// as the token fires, even mid-wait.
    pub async fn acquire(&self, cancel: &CancellationToken) -> AppResult<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }
            match self.try_acquire() {
                Ok(()) => return Ok(()),
                Err(wait) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(AppError::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }
}
