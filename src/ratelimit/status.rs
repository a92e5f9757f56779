//! Decision metadata reported alongside allow/deny.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Header carrying the configured limit.
pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
/// Header carrying the remaining allowance.
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
/// Header carrying the reset time in epoch seconds.
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
/// Header telling a rejected caller how long to back off.
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

/// The outcome of a single rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitStatus {
    /// Whether the request may proceed
    pub allowed: bool,
    /// The limit in force (bucket capacity or tier maximum)
    pub total: u64,
    /// Allowance left after this request; -1 when blocked
    pub remaining: i64,
    /// Length of the limiting period (one token, or one tier window)
    pub duration: Duration,
    /// When the allowance is fully restored
    pub reset_time: DateTime<Utc>,
    /// How long a rejected caller should wait; zero when allowed
    pub retry_after: Duration,
}

impl RateLimitStatus {
    /// Render the status as response headers for the embedding layer.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            (HEADER_LIMIT, self.total.to_string()),
            (HEADER_REMAINING, self.remaining.max(0).to_string()),
            (HEADER_RESET, self.reset_time.timestamp().to_string()),
        ];

        if !self.allowed {
            headers.push((HEADER_RETRY_AFTER, ceil_secs(self.retry_after).to_string()));
        }

        headers
    }
}

/// Whole seconds, rounded up, so a client never retries early.
fn ceil_secs(d: Duration) -> u64 {
    if d.subsec_nanos() > 0 {
        d.as_secs() + 1
    } else {
        d.as_secs()
    }
}
