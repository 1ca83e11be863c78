//! Per-entry resource governance.
//!
//! Each registry entry owns exactly one [`Governor`], chosen at construction
//! from its limit block by priority qps > qpm > concurrency > none. The
//! governor is the only mutable state shared between request flows; the
//! registry around it is immutable after build.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::config::Limit;
use crate::error::GatewayError;

/// Token bucket with a fixed capacity and steady refill rate.
///
/// Tokens are fractional so sub-second refill intervals (qps) and
/// multi-second intervals (qpm) share one implementation. The critical
/// section is a plain mutex held only to refill and decrement; waiting
/// happens outside the lock.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: f64::from(capacity),
            refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: f64::from(capacity),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, or report how long until one is available.
    fn try_consume(&self) -> Result<(), Duration> {
        let mut state = self.state.lock().expect("bucket lock poisoned");

        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - state.tokens;
            Err(Duration::from_secs_f64(missing / self.refill_per_sec))
        }
    }

    /// Wait until a token has been taken.
    async fn consume(&self) {
        loop {
            match self.try_consume() {
                Ok(()) => return,
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }
}

/// The active governance mode for one entry.
#[derive(Debug)]
pub enum Governor {
    /// Token bucket, capacity = qps, refilled at qps tokens per second.
    Qps(TokenBucket),
    /// Token bucket, capacity = qpm, refilled at one token per 60/qpm seconds.
    Qpm(TokenBucket),
    /// Fixed permit pool, fully pre-loaded at construction.
    Concurrency(Arc<Semaphore>),
    /// Acquire always succeeds immediately.
    Unlimited,
}

impl Governor {
    /// Select the mode from a limit block. The choice is final: it is never
    /// re-evaluated after construction.
    pub fn from_limit(limit: &Limit) -> Self {
        if limit.qps > 0 {
            Governor::Qps(TokenBucket::new(limit.qps, f64::from(limit.qps)))
        } else if limit.qpm > 0 {
            Governor::Qpm(TokenBucket::new(limit.qpm, f64::from(limit.qpm) / 60.0))
        } else if limit.concurrency > 0 {
            Governor::Concurrency(Arc::new(Semaphore::new(limit.concurrency as usize)))
        } else {
            Governor::Unlimited
        }
    }

    /// Block until a token/permit is available or the deadline elapses.
    ///
    /// A timed-out acquire has no side effects: no token is consumed and no
    /// permit is taken. A zero deadline still allows an immediately-available
    /// token through, so `timeout: 0` entries fail fast only under pressure.
    pub async fn acquire(&self, timeout: Duration) -> Result<Permit, GatewayError> {
        match self {
            Governor::Qps(bucket) | Governor::Qpm(bucket) => {
                tokio::time::timeout(timeout, bucket.consume())
                    .await
                    .map_err(|_| exhausted(timeout))?;
                Ok(Permit { inner: None })
            }
            Governor::Concurrency(pool) => {
                let permit = tokio::time::timeout(timeout, pool.clone().acquire_owned())
                    .await
                    .map_err(|_| exhausted(timeout))?
                    .map_err(|_| {
                        GatewayError::ResourceExhausted("permit pool closed".to_string())
                    })?;
                Ok(Permit {
                    inner: Some(permit),
                })
            }
            Governor::Unlimited => Ok(Permit { inner: None }),
        }
    }

    /// Short mode name for logs and the status endpoint.
    pub fn mode(&self) -> &'static str {
        match self {
            Governor::Qps(_) => "qps",
            Governor::Qpm(_) => "qpm",
            Governor::Concurrency(_) => "concurrency",
            Governor::Unlimited => "unlimited",
        }
    }
}

fn exhausted(timeout: Duration) -> GatewayError {
    GatewayError::ResourceExhausted(format!(
        "no capacity within {}ms",
        timeout.as_millis()
    ))
}

/// Witness of a successful acquire.
///
/// Concurrency permits return to the pool either through [`Permit::release`]
/// or on drop, so a cancelled flow cannot leak a slot. Rate-limiter acquires
/// carry no permit; consumed tokens are not returned.
#[derive(Debug)]
pub struct Permit {
    inner: Option<OwnedSemaphorePermit>,
}

impl Permit {
    /// Return the permit to its pool. No-op for rate-limiter and unlimited
    /// modes.
    pub fn release(mut self) {
        self.inner.take();
    }
}
