//! Per-provider token bucket.
//!
//! Backed by `governor`'s GCRA limiter, whose state is a single atomic, so one
//! [`RateLimiter`] can be shared through an `Arc` by every unit targeting the
//! same provider.

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;
use std::num::NonZeroU32;
use std::time::{Duration, Instant};

type DirectLimiter = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Rate limiter errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RateLimitError {
    /// No token became available within the acquire timeout
    #[error("Rate limit exceeded for {provider}: no token within {waited:?}")]
    Exceeded { provider: String, waited: Duration },

    /// Rate or capacity cannot form a quota
    #[error("Invalid rate limit for {provider}: {rate}/s, capacity {capacity}")]
    InvalidQuota {
        provider: String,
        rate: f64,
        capacity: u32,
    },
}

/// Token bucket for one provider
pub struct RateLimiter {
    provider: String,
    rate: f64,
    capacity: u32,
    limiter: DirectLimiter,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("provider", &self.provider)
            .field("rate", &self.rate)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl RateLimiter {
    /// Create a bucket refilling `rate` tokens per second (fractional rates
    /// allowed) holding at most `capacity` tokens.
    pub fn new(provider: &str, rate: f64, capacity: u32) -> Result<Self, RateLimitError> {
        let invalid = || RateLimitError::InvalidQuota {
            provider: provider.to_string(),
            rate,
            capacity,
        };
        if !rate.is_finite() || rate <= 0.0 {
            return Err(invalid());
        }
        let burst = NonZeroU32::new(capacity).ok_or_else(invalid)?;
        let quota = Quota::with_period(Duration::from_secs_f64(1.0 / rate))
            .ok_or_else(invalid)?
            .allow_burst(burst);

        Ok(Self {
            provider: provider.to_string(),
            rate,
            capacity,
            limiter: governor::RateLimiter::direct(quota),
        })
    }

    /// Create a bucket with the default capacity of five seconds' worth of
    /// tokens (at least one).
    pub fn with_rate(provider: &str, rate: f64) -> Result<Self, RateLimitError> {
        Self::new(provider, rate, default_capacity(rate))
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Wait for a token, failing with [`RateLimitError::Exceeded`] once
    /// `timeout` elapses. A timed-out wait consumes nothing.
    pub async fn acquire(&self, timeout: Duration) -> Result<(), RateLimitError> {
        let started = Instant::now();
        match tokio::time::timeout(timeout, self.limiter.until_ready()).await {
            Ok(()) => {
                let waited = started.elapsed();
                if waited > Duration::from_millis(100) {
                    tracing::debug!("{}: waited {:?} for a request token", self.provider, waited);
                }
                Ok(())
            }
            Err(_) => Err(RateLimitError::Exceeded {
                provider: self.provider.clone(),
                waited: timeout,
            }),
        }
    }

    /// Take a token without waiting
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

/// `max(1, floor(rate * 5))`
pub fn default_capacity(rate: f64) -> u32 {
    let capacity = (rate * 5.0).floor();
    if capacity.is_finite() && capacity >= 1.0 {
        capacity.min(u32::MAX as f64) as u32
    } else {
        1
    }
}
