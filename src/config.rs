//! Configuration management for Turnstile.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{
    BucketConfig, FailurePolicy, PolicyTier, TierPolicy, DEFAULT_KEY_PREFIX, DEFAULT_SHARD_COUNT,
};

/// Prefix of environment variables overriding file settings.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for a Turnstile limiter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Limiter backend configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Escalating tiers for the tiered and shared backends
    #[serde(default)]
    pub tiers: Vec<TierConfig>,

    /// Behavior when the backend cannot decide
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Background sweep interval; lazy sweeping only when unset
    #[serde(default)]
    pub sweep_interval_secs: Option<u64>,
}

/// Which store backs the limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Single-lock visitor table
    Table,
    /// Sharded visitor table
    #[default]
    Sharded,
    /// In-process escalating tiers
    Tiered,
    /// Escalating tiers evaluated by a shared script store
    Shared,
}

/// Token bucket and store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Tokens added per second
    #[serde(default = "default_rate")]
    pub rate: f64,

    /// Bucket capacity; `floor(rate)` when unset
    #[serde(default)]
    pub burst: Option<u32>,

    /// Idle time after which a visitor may be evicted
    #[serde(default = "default_expires_in_secs")]
    pub expires_in_secs: u64,

    /// Number of shards for the sharded backend
    #[serde(default = "default_shard_count")]
    pub shard_count: usize,

    /// Store implementation
    #[serde(default)]
    pub backend: BackendKind,

    /// Key prefix for the shared backend
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            rate: default_rate(),
            burst: None,
            expires_in_secs: default_expires_in_secs(),
            shard_count: default_shard_count(),
            backend: BackendKind::default(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_rate() -> f64 {
    10.0
}

fn default_expires_in_secs() -> u64 {
    180
}

fn default_shard_count() -> usize {
    DEFAULT_SHARD_COUNT
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

impl LimiterConfig {
    /// The bucket configuration, with `burst` defaulted from `rate`.
    pub fn bucket(&self) -> Result<BucketConfig> {
        let burst = self.burst.unwrap_or(self.rate.max(0.0).floor() as u32);
        BucketConfig::new(self.rate, burst)
    }

    /// The idle eviction horizon.
    pub fn expires_in(&self) -> Duration {
        Duration::from_secs(self.expires_in_secs)
    }
}

/// One escalation tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierConfig {
    /// Requests allowed per window
    pub max: u64,
    /// Window length in milliseconds
    pub duration_ms: u64,
}

impl TurnstileConfig {
    /// Parse configuration from YAML text.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load an optional file overlaid with `TURNSTILE__*` environment
    /// variables, e.g. `TURNSTILE__LIMITER__RATE=5`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: TurnstileConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no store could be built from.
    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval_secs == Some(0) {
            return Err(TurnstileError::Config(
                "sweep_interval_secs must be greater than zero".to_string(),
            ));
        }

        match self.limiter.backend {
            BackendKind::Table | BackendKind::Sharded => {
                if !self.tiers.is_empty() {
                    return Err(TurnstileError::Config(format!(
                        "tiers are not used by the {:?} backend",
                        self.limiter.backend
                    )));
                }
                self.limiter.bucket()?;
                if self.limiter.expires_in_secs == 0 {
                    return Err(TurnstileError::Config(
                        "expires_in_secs must be greater than zero".to_string(),
                    ));
                }
                if self.limiter.backend == BackendKind::Sharded && self.limiter.shard_count == 0 {
                    return Err(TurnstileError::Config(
                        "shard_count must be at least 1".to_string(),
                    ));
                }
            }
            BackendKind::Tiered | BackendKind::Shared => {
                if self.tiers.is_empty() {
                    return Err(TurnstileError::Config(format!(
                        "the {:?} backend needs at least one tier",
                        self.limiter.backend
                    )));
                }
                self.tier_policy()?;
            }
        }

        Ok(())
    }

    /// The configured tiers as a policy.
    pub fn tier_policy(&self) -> Result<TierPolicy> {
        TierPolicy::new(
            self.tiers
                .iter()
                .map(|tier| PolicyTier::new(tier.max, Duration::from_millis(tier.duration_ms)))
                .collect(),
        )
    }

    /// The background sweep interval, if enabled.
    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval_secs.map(Duration::from_secs)
    }
}
