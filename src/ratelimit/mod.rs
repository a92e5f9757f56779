//! Rate limiting logic and state management.

mod backend;
mod bucket;
pub mod clock;
mod limiter;
mod shared;
mod sharded;
mod status;
mod sweeper;
mod table;
mod tiers;
mod visitor;

pub use backend::{RateLimiterStore, Sweep};
pub use bucket::{BucketConfig, TokenBucket};
pub use clock::{Clock, ManualClock, SystemClock};
pub use limiter::{
    Decision, ExtractIdentifier, FailurePolicy, Limiter, LimiterBuilder, Rejection,
    STATUS_FORBIDDEN, STATUS_SERVICE_UNAVAILABLE, STATUS_TOO_MANY_REQUESTS,
};
pub use shared::{
    MemoryScriptStore, ScriptHandle, ScriptStore, SharedStoreLimiter, DEFAULT_KEY_PREFIX,
    TIERED_SCRIPT,
};
pub use sharded::{shard_for, ShardedVisitorTable, DEFAULT_SHARD_COUNT};
pub use status::{
    RateLimitStatus, HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET, HEADER_RETRY_AFTER,
};
pub use sweeper::{spawn_sweeper, SweeperHandle};
pub use table::{VisitorTable, DEFAULT_EXPIRES_IN};
pub use tiers::{
    MultiTierPolicyResolver, PolicyTier, TierPolicy, TierSlot, TierStatus, TierWindow,
    TieredTable,
};
