//! Token bucket implementation.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::clock::{add_duration, elapsed_between};
use super::status::RateLimitStatus;
use crate::error::{Result, TurnstileError};

/// Refill rate and burst size shared by every bucket of a store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    /// Sustained tokens added per second
    pub rate: f64,
    /// Maximum tokens a bucket can hold
    pub burst: u32,
}

impl BucketConfig {
    /// Create a validated bucket configuration.
    pub fn new(rate: f64, burst: u32) -> Result<Self> {
        let config = Self { rate, burst };
        config.validate()?;
        Ok(config)
    }

    /// Reject non-positive or non-finite values.
    pub fn validate(&self) -> Result<()> {
        if !self.rate.is_finite() || self.rate <= 0.0 {
            return Err(TurnstileError::Config(format!(
                "rate must be a positive number of tokens per second, got {}",
                self.rate
            )));
        }
        if self.burst == 0 {
            return Err(TurnstileError::Config("burst must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Time needed to refill a single token.
    pub fn token_interval(&self) -> Duration {
        secs_to_duration(1.0 / self.rate)
    }
}

/// A token bucket for one identifier.
///
/// The bucket carries no lock of its own; callers hold the table or shard
/// lock for the whole refill-and-decide sequence.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Maximum tokens (burst)
    capacity: f64,
    /// Tokens added per second
    refill_rate: f64,
    /// Tokens currently available
    tokens: f64,
    /// When tokens were last added
    last_refill: DateTime<Utc>,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(config: &BucketConfig, now: DateTime<Utc>) -> Self {
        Self {
            capacity: f64::from(config.burst),
            refill_rate: config.rate,
            tokens: f64::from(config.burst),
            last_refill: now,
        }
    }

    /// Try to take one token.
    pub fn allow(&mut self, now: DateTime<Utc>) -> bool {
        self.allow_n(1, now)
    }

    /// Try to take `n` tokens at once; nothing is taken on failure.
    pub fn allow_n(&mut self, n: u32, now: DateTime<Utc>) -> bool {
        self.refill(now);

        let wanted = f64::from(n);
        if self.tokens >= wanted {
            self.tokens -= wanted;
            true
        } else {
            false
        }
    }

    /// Whole tokens currently available.
    pub fn remaining(&self) -> i64 {
        self.tokens.floor() as i64
    }

    /// When the bucket will be full again if left alone.
    pub fn reset_time(&self) -> DateTime<Utc> {
        add_duration(self.last_refill, self.time_to_accumulate(self.capacity))
    }

    /// Time until `n` tokens are available, or `None` if `n` exceeds capacity.
    pub fn time_until_available(&self, n: u32) -> Option<Duration> {
        let wanted = f64::from(n);
        if wanted > self.capacity {
            return None;
        }
        Some(self.time_to_accumulate(wanted))
    }

    /// Maximum tokens this bucket holds.
    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }

    /// Time needed to refill a single token.
    pub fn token_interval(&self) -> Duration {
        secs_to_duration(1.0 / self.refill_rate)
    }

    /// Build the metadata for a decision just taken on this bucket.
    pub fn status(&self, allowed: bool, requested: u32) -> RateLimitStatus {
        let retry_after = if allowed {
            Duration::ZERO
        } else {
            // Unsatisfiable requests are told to wait for a full bucket.
            self.time_until_available(requested)
                .unwrap_or_else(|| self.time_to_accumulate(self.capacity))
        };

        RateLimitStatus {
            allowed,
            total: u64::from(self.capacity()),
            remaining: if allowed { self.remaining() } else { -1 },
            duration: self.token_interval(),
            reset_time: self.reset_time(),
            retry_after,
        }
    }

    /// Add tokens for the time elapsed since the last refill.
    fn refill(&mut self, now: DateTime<Utc>) {
        let elapsed = elapsed_between(self.last_refill, now);
        if elapsed > Duration::ZERO {
            self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
            self.last_refill = now;
        }
    }

    fn time_to_accumulate(&self, target: f64) -> Duration {
        let missing = (target - self.tokens).max(0.0);
        secs_to_duration(missing / self.refill_rate)
    }
}

/// Seconds as a duration, saturating for very slow rates.
fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}
