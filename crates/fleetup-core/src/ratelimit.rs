//! Token-bucket rate limiter for the management console.
//!
//! Direct-to-device calls are naturally serialized per device by the
//! workflow, but discovery fans hundreds of queries into one console; the
//! bucket keeps that under the configured requests-per-minute figure.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Shared token bucket. Tokens refill continuously at the configured rate
/// up to a burst capacity of one minute's worth.
#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<BucketState>,
    per_minute: f64,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Bucket allowing `per_minute` requests per minute, starting full.
    #[must_use]
    pub fn new(per_minute: u32) -> Self {
        let per_minute = f64::from(per_minute.max(1));
        Self {
            state: Mutex::new(BucketState {
                tokens: per_minute,
                last_refill: Instant::now(),
            }),
            per_minute,
        }
    }

    /// Takes a token without waiting. Returns `false` when the bucket is
    /// empty.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().expect("rate limiter lock");
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill);
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.per_minute / 60.0)
            .min(self.per_minute);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Waits until a token is available, then takes it.
    pub async fn acquire(&self) {
        loop {
            if self.try_acquire() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}
