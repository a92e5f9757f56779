//! Escalating multi-tier rate limit policies.
//!
//! A policy is an ordered list of `(max, duration)` tiers, most permissive
//! first. Each identifier has a *window* (the tier currently counting down)
//! and, once a window has been exhausted, a *status* entry remembering which
//! tier the next window should start at. The status entry outlives a single
//! window (twice the exhausted tier's duration), so a caller that keeps
//! hammering stays on the stricter tier while an idle caller cools down back
//! to the first one.
//!
//! ```text
//!     tiers: [(3, 10s), (1, 20s)]
//!
//!     t=0   req req req        -> window tier 0: 2, 1, 0
//!     t=0   req                -> -1, denied, status := tier 1 (expires t=20s)
//!     t=10  req                -> window expired, status live: tier 1: 0
//!     t=10  req                -> -1, denied, status refreshed (expires t=50s)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::backend::{RateLimiterStore, Sweep};
use super::clock::{add_duration, elapsed_between, system_clock, Clock};
use super::status::RateLimitStatus;
use crate::error::{Result, TurnstileError};

/// One step of an escalating policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyTier {
    /// Requests allowed per window
    pub max: u64,
    /// Window length
    pub duration: Duration,
}

impl PolicyTier {
    /// Create a tier.
    pub fn new(max: u64, duration: Duration) -> Self {
        Self { max, duration }
    }
}

/// A validated, non-empty sequence of tiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierPolicy {
    tiers: Vec<PolicyTier>,
}

impl TierPolicy {
    /// Validate and wrap a list of tiers.
    pub fn new(tiers: Vec<PolicyTier>) -> Result<Self> {
        if tiers.is_empty() {
            return Err(TurnstileError::Policy(
                "at least one tier is required".to_string(),
            ));
        }
        for (index, tier) in tiers.iter().enumerate() {
            if tier.max == 0 {
                return Err(TurnstileError::Policy(format!(
                    "tier {} max must be positive",
                    index
                )));
            }
            if tier.duration.as_millis() == 0 {
                return Err(TurnstileError::Policy(format!(
                    "tier {} duration must be at least 1ms",
                    index
                )));
            }
            if i64::try_from(tier.max).is_err()
                || i64::try_from(tier.duration.as_millis()).is_err()
            {
                return Err(TurnstileError::Policy(format!(
                    "tier {} is out of range",
                    index
                )));
            }
        }
        Ok(Self { tiers })
    }

    /// A single-tier policy.
    pub fn single(max: u64, duration: Duration) -> Result<Self> {
        Self::new(vec![PolicyTier::new(max, duration)])
    }

    /// Parse the flat `max, duration_ms, max, duration_ms, ...` form.
    pub fn from_args(args: &[i64]) -> Result<Self> {
        if args.is_empty() || args.len() % 2 != 0 {
            return Err(TurnstileError::Policy(format!(
                "tier arguments must be non-empty (max, duration_ms) pairs, got {} values",
                args.len()
            )));
        }

        let tiers = args
            .chunks_exact(2)
            .enumerate()
            .map(|(index, pair)| {
                let (max, duration_ms) = (pair[0], pair[1]);
                if max <= 0 || duration_ms <= 0 {
                    return Err(TurnstileError::Policy(format!(
                        "tier {} must have positive max and duration, got ({}, {})",
                        index, max, duration_ms
                    )));
                }
                Ok(PolicyTier::new(
                    max as u64,
                    Duration::from_millis(duration_ms as u64),
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        Self::new(tiers)
    }

    /// The flat `max, duration_ms, ...` form.
    pub fn to_args(&self) -> Vec<i64> {
        self.tiers
            .iter()
            .flat_map(|tier| [tier.max as i64, tier.duration.as_millis() as i64])
            .collect()
    }

    /// The tiers, most permissive first.
    pub fn tiers(&self) -> &[PolicyTier] {
        &self.tiers
    }

    /// Number of tiers.
    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    /// Always false; a policy has at least one tier.
    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    /// The longest window of any tier.
    pub fn longest_duration(&self) -> Duration {
        self.tiers
            .iter()
            .map(|tier| tier.duration)
            .max()
            .unwrap_or_default()
    }
}

/// The window currently counting down for one identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierWindow {
    /// Index of the tier this window was opened at
    pub tier: usize,
    /// Requests left; -1 once exhausted
    pub count: i64,
    /// The tier maximum
    pub total: u64,
    /// The tier duration
    pub duration: Duration,
    /// When the window closes
    pub reset_time: DateTime<Utc>,
}

/// The remembered escalation level for one identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierStatus {
    /// Tier the next window starts at
    pub index: usize,
    /// When the escalation is forgotten
    pub expires_at: DateTime<Utc>,
}

/// Everything tracked for one identifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierSlot {
    /// Current window, if any
    pub window: Option<TierWindow>,
    /// Escalation memory, if any
    pub status: Option<TierStatus>,
}

impl TierSlot {
    /// Whether nothing in the slot is still live at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let window_live = self.window.is_some_and(|w| w.reset_time > now);
        let status_live = self.status.is_some_and(|s| s.expires_at > now);
        !window_live && !status_live
    }
}

/// Applies a [`TierPolicy`] to per-identifier state.
///
/// The resolver is pure: it reads and updates a [`TierSlot`] but never owns
/// one. Callers make each `resolve` atomic, either under their own lock or by
/// running it inside a single shared-store round trip.
#[derive(Debug, Clone)]
pub struct MultiTierPolicyResolver {
    policy: TierPolicy,
}

impl MultiTierPolicyResolver {
    /// Create a resolver for `policy`.
    pub fn new(policy: TierPolicy) -> Self {
        Self { policy }
    }

    /// The policy being applied.
    pub fn policy(&self) -> &TierPolicy {
        &self.policy
    }

    /// Count one request against `slot` and report the outcome.
    pub fn resolve(&self, slot: &mut TierSlot, now: DateTime<Utc>) -> RateLimitStatus {
        if let Some(status) = slot.status {
            if status.expires_at <= now {
                slot.status = None;
            }
        }

        let live = slot.window.filter(|window| window.reset_time > now);
        let window = match live {
            Some(mut window) => {
                if window.count >= 0 {
                    window.count -= 1;
                    if window.count == -1 && self.policy.len() > 1 {
                        self.escalate(slot, &window, now);
                    }
                }
                window
            }
            None => self.open_window(slot, now),
        };

        slot.window = Some(window);
        status_for(&window, now)
    }

    /// Start a fresh window at the remembered tier, or the first one.
    fn open_window(&self, slot: &TierSlot, now: DateTime<Utc>) -> TierWindow {
        let index = slot
            .status
            .map_or(0, |status| status.index.min(self.policy.len() - 1));
        let tier = self.policy.tiers[index];

        trace!(tier = index, max = tier.max, "Opening tier window");

        TierWindow {
            tier: index,
            count: tier.max as i64 - 1,
            total: tier.max,
            duration: tier.duration,
            reset_time: add_duration(now, tier.duration),
        }
    }

    /// Remember a stricter tier for the next window.
    fn escalate(&self, slot: &mut TierSlot, window: &TierWindow, now: DateTime<Utc>) {
        let index = (window.tier + 1).min(self.policy.len() - 1);
        debug!(from = window.tier, to = index, "Escalating policy tier");

        slot.status = Some(TierStatus {
            index,
            expires_at: add_duration(now, window.duration * 2),
        });
    }
}

fn status_for(window: &TierWindow, now: DateTime<Utc>) -> RateLimitStatus {
    let allowed = window.count >= 0;
    RateLimitStatus {
        allowed,
        total: window.total,
        remaining: window.count,
        duration: window.duration,
        reset_time: window.reset_time,
        retry_after: if allowed {
            Duration::ZERO
        } else {
            elapsed_between(now, window.reset_time)
        },
    }
}

/// In-process store applying a [`TierPolicy`] per identifier.
///
/// All slots sit behind one lock; a sweep drops slots whose window and
/// status have both expired. Sweeps run lazily once per longest tier
/// duration, or on demand.
pub struct TieredTable {
    resolver: MultiTierPolicyResolver,
    state: Mutex<TieredState>,
    clock: Arc<dyn Clock>,
}

struct TieredState {
    slots: HashMap<String, TierSlot>,
    next_sweep: DateTime<Utc>,
}

impl TieredTable {
    /// Create a tiered table using the system clock.
    pub fn new(policy: TierPolicy) -> Self {
        Self::with_clock(policy, system_clock())
    }

    /// Create a tiered table reading time from `clock`.
    pub fn with_clock(policy: TierPolicy, clock: Arc<dyn Clock>) -> Self {
        let next_sweep = add_duration(clock.now(), policy.longest_duration());
        Self {
            resolver: MultiTierPolicyResolver::new(policy),
            state: Mutex::new(TieredState {
                slots: HashMap::new(),
                next_sweep,
            }),
            clock,
        }
    }

    /// Count one request for `identifier`.
    pub fn allow(&self, identifier: &str) -> bool {
        self.check(identifier).allowed
    }

    /// Count one request for `identifier` and report the full status.
    pub fn check(&self, identifier: &str) -> RateLimitStatus {
        let status = {
            let mut state = self.state.lock();
            let now = self.clock.now();

            let slot = state.slots.entry(identifier.to_owned()).or_default();
            let status = self.resolver.resolve(slot, now);

            if now >= state.next_sweep {
                Self::sweep_locked(&mut state, self.resolver.policy(), now);
            }
            status
        };

        if !status.allowed {
            debug!(identifier = %identifier, total = status.total, "Tier limit exceeded");
        }
        status
    }

    /// Drop expired slots now.
    pub fn sweep(&self) -> usize {
        let mut state = self.state.lock();
        let removed = Self::sweep_locked(&mut state, self.resolver.policy(), self.clock.now());
        if removed > 0 {
            debug!(removed, "Evicted idle tier slots");
        }
        removed
    }

    /// The current state for `identifier`, if tracked.
    pub fn slot(&self, identifier: &str) -> Option<TierSlot> {
        self.state.lock().slots.get(identifier).copied()
    }

    /// Number of identifiers tracked.
    pub fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Whether no identifier is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every identifier.
    pub fn clear(&self) {
        self.state.lock().slots.clear();
    }

    /// The policy being applied.
    pub fn policy(&self) -> &TierPolicy {
        self.resolver.policy()
    }

    fn sweep_locked(state: &mut TieredState, policy: &TierPolicy, now: DateTime<Utc>) -> usize {
        let before = state.slots.len();
        state.slots.retain(|_, slot| !slot.is_expired(now));
        state.next_sweep = add_duration(now, policy.longest_duration());
        before - state.slots.len()
    }
}

impl std::fmt::Debug for TieredTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredTable")
            .field("policy", self.resolver.policy())
            .field("slots", &self.len())
            .finish()
    }
}

#[async_trait]
impl RateLimiterStore for TieredTable {
    async fn check(&self, identifier: &str) -> Result<RateLimitStatus> {
        Ok(TieredTable::check(self, identifier))
    }
}

impl Sweep for TieredTable {
    fn sweep(&self) -> usize {
        TieredTable::sweep(self)
    }
}
