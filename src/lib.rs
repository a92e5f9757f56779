//! Turnstile - Request Rate Limiting Engine
//!
//! This crate decides, per caller identifier, whether a request may proceed.
//! It offers token-bucket visitor tables (single-lock or sharded) with idle
//! eviction, escalating multi-tier policies, and a shared-store backend that
//! evaluates tiers atomically through a preloaded script so several
//! instances can share one set of counters.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use turnstile::ratelimit::{BucketConfig, Limiter, ShardedVisitorTable};
//!
//! # async fn run() -> turnstile::error::Result<()> {
//! let table = ShardedVisitorTable::new(BucketConfig::new(1.0, 3)?, Duration::from_secs(180), 15)?;
//! let limiter = Limiter::builder().memory_store(Arc::new(table)).build()?;
//!
//! if let Some(rejection) = limiter.check("127.0.0.1").await.rejection() {
//!     println!("rejected with {}", rejection.status);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod ratelimit;

pub use config::TurnstileConfig;
pub use error::{Result, TurnstileError};
pub use ratelimit::{Decision, Limiter, RateLimitStatus, RateLimiterStore};
