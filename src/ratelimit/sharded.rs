//! Visitor table partitioned into independently locked shards.
//!
//! Identifiers are spread over a fixed number of shards by a cheap byte-sum
//! hash. Each shard has its own lock and its own sweep schedule, so unrelated
//! identifiers never contend and eviction cost is spread across shards
//! instead of stalling every caller at once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::backend::{RateLimiterStore, Sweep};
use super::bucket::BucketConfig;
use super::clock::{system_clock, Clock};
use super::status::RateLimitStatus;
use super::table::validate_expires_in;
use super::visitor::Shard;
use crate::error::{Result, TurnstileError};

/// Shard count used when none is configured.
pub const DEFAULT_SHARD_COUNT: usize = 15;

/// Map an identifier to its shard.
///
/// Pure function of the identifier bytes; the same identifier always lands
/// in the same shard for a given `shard_count`.
pub fn shard_for(identifier: &str, shard_count: usize) -> usize {
    let sum = identifier
        .bytes()
        .fold(0u64, |acc, b| acc.wrapping_add(u64::from(b)));
    (sum % shard_count as u64) as usize
}

/// A visitor table split into `shard_count` partitions.
///
/// Behaves exactly like [`VisitorTable`](super::VisitorTable) for any single
/// identifier; only contention and sweep granularity differ.
pub struct ShardedVisitorTable {
    config: BucketConfig,
    expires_in: Duration,
    shards: Box<[Mutex<Shard>]>,
    clock: Arc<dyn Clock>,
}

impl ShardedVisitorTable {
    /// Create a sharded table using the system clock.
    pub fn new(config: BucketConfig, expires_in: Duration, shard_count: usize) -> Result<Self> {
        Self::with_clock(config, expires_in, shard_count, system_clock())
    }

    /// Create a sharded table reading time from `clock`.
    pub fn with_clock(
        config: BucketConfig,
        expires_in: Duration,
        shard_count: usize,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        validate_expires_in(expires_in)?;
        if shard_count == 0 {
            return Err(TurnstileError::Config(
                "shard_count must be at least 1".to_string(),
            ));
        }

        let now = clock.now();
        let shards = (0..shard_count)
            .map(|_| Mutex::new(Shard::new(now, expires_in)))
            .collect();

        Ok(Self {
            config,
            expires_in,
            shards,
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
    ///
    /// Only the identifier's own shard is locked.
    pub fn check_n(&self, identifier: &str, n: u32) -> RateLimitStatus {
        let index = self.shard_of(identifier);
        trace!(identifier = %identifier, shard = index, tokens = n, "Checking rate limit");

        let status = {
            let mut shard = self.shards[index].lock();
            let now = self.clock.now();
            shard.check_n(identifier, n, &self.config, self.expires_in, now)
        };

        if !status.allowed {
            debug!(identifier = %identifier, shard = index, "Rate limit exceeded");
        }
        status
    }

    /// Sweep every shard now, one lock at a time.
    pub fn sweep(&self) -> usize {
        let mut removed = 0;
        for (index, shard) in self.shards.iter().enumerate() {
            let swept = shard.lock().sweep(self.expires_in, self.clock.now());
            if swept > 0 {
                trace!(shard = index, removed = swept, "Evicted idle visitors");
            }
            removed += swept;
        }
        if removed > 0 {
            debug!(removed, "Evicted idle visitors");
        }
        removed
    }

    /// The shard `identifier` belongs to.
    pub fn shard_of(&self, identifier: &str) -> usize {
        shard_for(identifier, self.shards.len())
    }

    /// Number of shards, fixed at construction.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Number of identifiers tracked by one shard.
    pub fn shard_len(&self, index: usize) -> usize {
        self.shards.get(index).map_or(0, |shard| shard.lock().len())
    }

    /// Number of identifiers tracked across all shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    /// Whether no identifier is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `identifier` currently has a bucket.
    pub fn contains(&self, identifier: &str) -> bool {
        self.shards[self.shard_of(identifier)].lock().contains(identifier)
    }

    /// Forget every identifier.
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.lock().clear();
        }
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

impl std::fmt::Debug for ShardedVisitorTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedVisitorTable")
            .field("config", &self.config)
            .field("expires_in", &self.expires_in)
            .field("shards", &self.shards.len())
            .finish()
    }
}

#[async_trait]
impl RateLimiterStore for ShardedVisitorTable {
    async fn check(&self, identifier: &str) -> Result<RateLimitStatus> {
        Ok(ShardedVisitorTable::check(self, identifier))
    }
}

impl Sweep for ShardedVisitorTable {
    fn sweep(&self) -> usize {
        ShardedVisitorTable::sweep(self)
    }
}
