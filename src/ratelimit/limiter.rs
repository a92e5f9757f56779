//! Limiter facade used by the embedding layer.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::backend::{RateLimiterStore, Sweep};
use super::shared::{MemoryScriptStore, SharedStoreLimiter};
use super::sharded::ShardedVisitorTable;
use super::status::RateLimitStatus;
use super::sweeper::{spawn_sweeper, SweeperHandle};
use super::table::VisitorTable;
use super::tiers::TieredTable;
use crate::config::{BackendKind, TurnstileConfig};
use crate::error::{Result, TurnstileError};

/// HTTP status for a denied request.
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;
/// HTTP status when no identifier could be extracted.
pub const STATUS_FORBIDDEN: u16 = 403;
/// HTTP status when the backend failed and the limiter fails closed.
pub const STATUS_SERVICE_UNAVAILABLE: u16 = 503;

/// What to do with a request when the backend cannot decide.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Let the request through
    FailOpen,
    /// Reject the request
    #[default]
    FailClosed,
}

/// The outcome of a limiter check.
#[derive(Debug)]
pub enum Decision {
    /// Within limits
    Allowed(RateLimitStatus),
    /// Over the limit
    Denied(RateLimitStatus),
    /// The backend failed; `allowed` is what the failure policy chose
    Degraded { allowed: bool, error: TurnstileError },
    /// No identifier could be extracted from the request
    Unidentified,
}

impl Decision {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        match self {
            Decision::Allowed(_) => true,
            Decision::Denied(_) | Decision::Unidentified => false,
            Decision::Degraded { allowed, .. } => *allowed,
        }
    }

    /// The backend status, when the backend answered.
    pub fn status(&self) -> Option<&RateLimitStatus> {
        match self {
            Decision::Allowed(status) | Decision::Denied(status) => Some(status),
            Decision::Degraded { .. } | Decision::Unidentified => None,
        }
    }

    /// The response to send instead of serving the request, if any.
    pub fn rejection(&self) -> Option<Rejection> {
        match self {
            Decision::Allowed(_) => None,
            Decision::Denied(status) => Some(Rejection {
                status: STATUS_TOO_MANY_REQUESTS,
                headers: status.headers(),
            }),
            Decision::Unidentified => Some(Rejection {
                status: STATUS_FORBIDDEN,
                headers: Vec::new(),
            }),
            Decision::Degraded { allowed: true, .. } => None,
            Decision::Degraded { allowed: false, .. } => Some(Rejection {
                status: STATUS_SERVICE_UNAVAILABLE,
                headers: Vec::new(),
            }),
        }
    }
}

/// A rejection response for the embedding layer to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: u16,
    pub headers: Vec<(&'static str, String)>,
}

/// Pulls the rate limiting identifier out of a request.
pub trait ExtractIdentifier<R> {
    /// The identifier for `request`, or `None` if it has none.
    fn extract(&self, request: &R) -> Option<String>;
}

impl<R, F> ExtractIdentifier<R> for F
where
    F: Fn(&R) -> Option<String>,
{
    fn extract(&self, request: &R) -> Option<String> {
        self(request)
    }
}

/// A store plus the policy for handling its failures.
///
/// Cheap to clone; clones share the same store.
#[derive(Clone)]
pub struct Limiter {
    store: Arc<dyn RateLimiterStore>,
    failure_policy: FailurePolicy,
    sweep_target: Option<Arc<dyn Sweep>>,
}

impl Limiter {
    /// Start building a limiter.
    pub fn builder() -> LimiterBuilder {
        LimiterBuilder::default()
    }

    /// Build the backend described by `config`.
    pub fn from_config(config: &TurnstileConfig) -> Result<Self> {
        config.validate()?;
        let limiter = &config.limiter;

        let builder = match limiter.backend {
            BackendKind::Table => Self::builder().memory_store(Arc::new(VisitorTable::new(
                limiter.bucket()?,
                limiter.expires_in(),
            )?)),
            BackendKind::Sharded => {
                Self::builder().memory_store(Arc::new(ShardedVisitorTable::new(
                    limiter.bucket()?,
                    limiter.expires_in(),
                    limiter.shard_count,
                )?))
            }
            BackendKind::Tiered => {
                Self::builder().memory_store(Arc::new(TieredTable::new(config.tier_policy()?)))
            }
            BackendKind::Shared => {
                let store = Arc::new(MemoryScriptStore::new());
                let shared = SharedStoreLimiter::new(store.clone(), config.tier_policy()?)
                    .with_prefix(limiter.key_prefix.clone());
                Self::builder()
                    .store(Arc::new(shared))
                    .sweep_target(store)
            }
        };

        info!(backend = ?limiter.backend, failure_policy = ?config.failure_policy, "Rate limiter configured");
        builder.failure_policy(config.failure_policy).build()
    }

    /// Check one request for `identifier`.
    ///
    /// Backend errors never surface as denials; the failure policy decides
    /// and the result is reported as [`Decision::Degraded`].
    pub async fn check(&self, identifier: &str) -> Decision {
        match self.store.check(identifier).await {
            Ok(status) if status.allowed => Decision::Allowed(status),
            Ok(status) => Decision::Denied(status),
            Err(error) => {
                let allowed = self.failure_policy == FailurePolicy::FailOpen;
                warn!(
                    identifier = %identifier,
                    error = %error,
                    allowed,
                    "Rate limit backend failed, applying failure policy"
                );
                Decision::Degraded { allowed, error }
            }
        }
    }

    /// Extract the identifier from `request` and check it.
    pub async fn check_request<R, E>(&self, request: &R, extractor: &E) -> Decision
    where
        E: ExtractIdentifier<R> + ?Sized,
    {
        match extractor.extract(request) {
            Some(identifier) => self.check(&identifier).await,
            None => {
                debug!("Request has no rate limit identifier");
                Decision::Unidentified
            }
        }
    }

    /// Start sweeping the backend in the background, if it holds local state.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_sweeper(&self, every: Duration) -> Option<SweeperHandle> {
        self.sweep_target
            .as_ref()
            .map(|target| spawn_sweeper(target.clone(), every))
    }

    /// The configured failure policy.
    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn RateLimiterStore> {
        &self.store
    }
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("failure_policy", &self.failure_policy)
            .field("sweeps", &self.sweep_target.is_some())
            .finish()
    }
}

/// Builder for [`Limiter`].
#[derive(Default)]
pub struct LimiterBuilder {
    store: Option<Arc<dyn RateLimiterStore>>,
    sweep_target: Option<Arc<dyn Sweep>>,
    failure_policy: FailurePolicy,
}

impl LimiterBuilder {
    /// Use `store` as the backend.
    pub fn store(mut self, store: Arc<dyn RateLimiterStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use an in-memory `store` that is also swept in the background.
    pub fn memory_store<T>(mut self, store: Arc<T>) -> Self
    where
        T: RateLimiterStore + Sweep + 'static,
    {
        self.store = Some(store.clone());
        self.sweep_target = Some(store);
        self
    }

    /// Sweep `target` when a background sweeper is started.
    pub fn sweep_target(mut self, target: Arc<dyn Sweep>) -> Self {
        self.sweep_target = Some(target);
        self
    }

    /// How to decide when the backend fails.
    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Finish the limiter; a backend store is required.
    pub fn build(self) -> Result<Limiter> {
        let store = self
            .store
            .ok_or_else(|| TurnstileError::Config("no rate limiter store configured".to_string()))?;

        Ok(Limiter {
            store,
            failure_policy: self.failure_policy,
            sweep_target: self.sweep_target,
        })
    }
}
