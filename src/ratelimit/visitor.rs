//! Visitor entries and the lockable partition that holds them.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use super::bucket::{BucketConfig, TokenBucket};
use super::clock::{add_duration, elapsed_between};
use super::status::RateLimitStatus;

/// One identifier's bucket plus the last time it was seen.
#[derive(Debug, Clone)]
pub(crate) struct Visitor {
    bucket: TokenBucket,
    last_seen: DateTime<Utc>,
}

/// A map of visitors with its own sweep schedule.
///
/// A shard is always accessed under a single lock held by its owner, so
/// lookups, bucket updates and sweeps never interleave.
#[derive(Debug)]
pub(crate) struct Shard {
    visitors: HashMap<String, Visitor>,
    next_sweep: DateTime<Utc>,
}

impl Shard {
    pub(crate) fn new(now: DateTime<Utc>, expires_in: Duration) -> Self {
        Self {
            visitors: HashMap::new(),
            next_sweep: add_duration(now, expires_in),
        }
    }

    /// Take `n` tokens from the identifier's bucket, creating it on first use.
    pub(crate) fn check_n(
        &mut self,
        identifier: &str,
        n: u32,
        config: &BucketConfig,
        expires_in: Duration,
        now: DateTime<Utc>,
    ) -> RateLimitStatus {
        let status = match self.visitors.get_mut(identifier) {
            Some(visitor) => {
                visitor.last_seen = now;
                let allowed = visitor.bucket.allow_n(n, now);
                visitor.bucket.status(allowed, n)
            }
            None => {
                let mut bucket = TokenBucket::new(config, now);
                let allowed = bucket.allow_n(n, now);
                debug!(
                    identifier = %identifier,
                    rate = config.rate,
                    burst = config.burst,
                    interval = ?config.token_interval(),
                    "Creating new visitor bucket"
                );
                let status = bucket.status(allowed, n);
                self.visitors.insert(
                    identifier.to_owned(),
                    Visitor {
                        bucket,
                        last_seen: now,
                    },
                );
                status
            }
        };

        self.sweep_if_due(expires_in, now);
        status
    }

    /// Sweep only when the schedule says so.
    pub(crate) fn sweep_if_due(&mut self, expires_in: Duration, now: DateTime<Utc>) -> usize {
        if now < self.next_sweep {
            return 0;
        }
        self.sweep(expires_in, now)
    }

    /// Drop every visitor idle for longer than `expires_in`.
    pub(crate) fn sweep(&mut self, expires_in: Duration, now: DateTime<Utc>) -> usize {
        let before = self.visitors.len();
        self.visitors
            .retain(|_, visitor| elapsed_between(visitor.last_seen, now) <= expires_in);
        self.next_sweep = add_duration(now, expires_in);

        let removed = before - self.visitors.len();
        trace!(removed, remaining = self.visitors.len(), "Swept shard");
        removed
    }

    pub(crate) fn len(&self) -> usize {
        self.visitors.len()
    }

    pub(crate) fn contains(&self, identifier: &str) -> bool {
        self.visitors.contains_key(identifier)
    }

    pub(crate) fn clear(&mut self) {
        self.visitors.clear();
    }
}
