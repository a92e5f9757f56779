//! Single-lock visitor table.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::backend::{RateLimiterStore, Sweep};
use super::bucket::BucketConfig;
use super::clock::{system_clock, Clock};
use super::status::RateLimitStatus;
use super::visitor::Shard;
use crate::error::{Result, TurnstileError};

/// How long an idle identifier is kept before a sweep may drop it.
pub const DEFAULT_EXPIRES_IN: Duration = Duration::from_secs(3 * 60);

/// Identifier → token bucket map guarded by one lock.
///
/// Every check, creation and sweep happens under the same mutex, so
/// per-identifier decisions are linearizable and a sweep never races an
/// access. Idle entries are swept lazily from the hot path once
/// `expires_in` has passed since the previous sweep.
pub struct VisitorTable {
    config: BucketConfig,
    expires_in: Duration,
    visitors: Mutex<Shard>,
    clock: Arc<dyn Clock>,
}

impl VisitorTable {
    /// Create a table using the system clock.
    pub fn new(config: BucketConfig, expires_in: Duration) -> Result<Self> {
        Self::with_clock(config, expires_in, system_clock())
    }

    /// Create a table reading time from `clock`.
    pub fn with_clock(
        config: BucketConfig,
        expires_in: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        validate_expires_in(expires_in)?;

        let now = clock.now();
        Ok(Self {
            config,
            expires_in,
            visitors: Mutex::new(Shard::new(now, expires_in)),
            clock,
        })
    }

    /// Take one token for `identifier`.
    pub fn allow(&self, identifier: &str) -> bool {
        self.check_n(identifier, 1).allowed
    }

    /// Take `n` tokens for `identifier`, all or nothing.
    pub fn allow_n(&self, identifier: &str, n: u32) -> bool {
        self.check_n(identifier, n).allowed
    }

    /// Take one token and report the full status.
    pub fn check(&self, identifier: &str) -> RateLimitStatus {
        self.check_n(identifier, 1)
    }

    /// Take `n` tokens and report the full status.
    pub fn check_n(&self, identifier: &str, n: u32) -> RateLimitStatus {
        trace!(identifier = %identifier, tokens = n, "Checking rate limit");

        let status = {
            let mut visitors = self.visitors.lock();
            let now = self.clock.now();
            visitors.check_n(identifier, n, &self.config, self.expires_in, now)
        };

        if !status.allowed {
            debug!(identifier = %identifier, "Rate limit exceeded");
        }
        status
    }

    /// Drop idle visitors regardless of the sweep schedule.
    pub fn sweep(&self) -> usize {
        let mut visitors = self.visitors.lock();
        let removed = visitors.sweep(self.expires_in, self.clock.now());
        if removed > 0 {
            debug!(removed, "Evicted idle visitors");
        }
        removed
    }

    /// Number of identifiers currently tracked.
    pub fn len(&self) -> usize {
        self.visitors.lock().len()
    }

    /// Whether no identifier is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `identifier` currently has a bucket.
    pub fn contains(&self, identifier: &str) -> bool {
        self.visitors.lock().contains(identifier)
    }

    /// Forget every identifier.
    pub fn clear(&self) {
        self.visitors.lock().clear();
    }

    /// The bucket configuration applied to new identifiers.
    pub fn config(&self) -> BucketConfig {
        self.config
    }

    /// The idle eviction horizon.
    pub fn expires_in(&self) -> Duration {
        self.expires_in
    }
}

impl std::fmt::Debug for VisitorTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisitorTable")
            .field("config", &self.config)
            .field("expires_in", &self.expires_in)
            .field("visitors", &self.len())
            .finish()
    }
}

#[async_trait]
impl RateLimiterStore for VisitorTable {
    async fn check(&self, identifier: &str) -> Result<RateLimitStatus> {
        Ok(VisitorTable::check(self, identifier))
    }
}

impl Sweep for VisitorTable {
    fn sweep(&self) -> usize {
        VisitorTable::sweep(self)
    }
}

pub(crate) fn validate_expires_in(expires_in: Duration) -> Result<()> {
    if expires_in.is_zero() {
        return Err(TurnstileError::Config(
            "expires_in must be greater than zero".to_string(),
        ));
    }
    Ok(())
}
