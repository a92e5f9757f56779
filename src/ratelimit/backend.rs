//! Store traits for abstracting in-memory and shared implementations.

use std::sync::Arc;

use async_trait::async_trait;

use super::status::RateLimitStatus;
use crate::error::Result;

/// Trait for rate limiter store implementations.
///
/// This trait abstracts over the in-memory visitor tables, the tiered table
/// and the shared-store limiter so the embedding layer works with any of
/// them. In-memory stores never return an error; shared stores report
/// backend failures as `Err` so they are never confused with a denial.
#[async_trait]
pub trait RateLimiterStore: Send + Sync {
    /// Consume one unit of allowance for `identifier` and report the outcome.
    async fn check(&self, identifier: &str) -> Result<RateLimitStatus>;

    /// Consume one unit of allowance and report only whether it was granted.
    async fn allow(&self, identifier: &str) -> Result<bool> {
        Ok(self.check(identifier).await?.allowed)
    }
}

#[async_trait]
impl<T: RateLimiterStore + ?Sized> RateLimiterStore for Arc<T> {
    async fn check(&self, identifier: &str) -> Result<RateLimitStatus> {
        (**self).check(identifier).await
    }
}

/// Stores that hold per-identifier state which can go stale.
pub trait Sweep: Send + Sync {
    /// Remove expired entries now, returning how many were dropped.
    fn sweep(&self) -> usize;
}
