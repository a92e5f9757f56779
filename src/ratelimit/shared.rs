//! Shared-store limiter driven by an atomic tier script.
//!
//! Several limiter instances can share one external store. Each check is a
//! single script evaluation against that store, which keeps the
//! read-decrement-escalate sequence atomic across instances. The store only
//! needs to implement [`ScriptStore`]; [`MemoryScriptStore`] is an
//! in-process implementation that executes the script under one lock.
//!
//! Wire contract for one check:
//!
//! ```text
//!     keys: ["{prefix}{identifier}", "{prefix}{identifier}:S"]
//!     args: [now_ms, max_1, duration_ms_1, max_2, duration_ms_2, ...]
//!     reply: [remaining, total, duration_ms, reset_epoch_ms]
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::backend::{RateLimiterStore, Sweep};
use super::clock::{add_duration, elapsed_between, system_clock, Clock};
use super::status::RateLimitStatus;
use super::tiers::{MultiTierPolicyResolver, TierPolicy, TierSlot, TierStatus, TierWindow};
use crate::error::{Result, TurnstileError};

/// Source of the tiered window script, as loaded into the shared store.
pub const TIERED_SCRIPT: &str = include_str!("tiered.lua");

/// Key prefix used when none is configured.
pub const DEFAULT_KEY_PREFIX: &str = "LIMIT:";

/// Suffix distinguishing an identifier's status key from its window key.
const STATUS_KEY_SUFFIX: &str = ":S";

/// Opaque reference to a script loaded into a [`ScriptStore`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScriptHandle(String);

impl ScriptHandle {
    /// Wrap a store-assigned script identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as assigned by the store.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ScriptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An external store able to run a preloaded script atomically.
#[async_trait]
pub trait ScriptStore: Send + Sync {
    /// Load `script` and return a handle for later evaluation.
    async fn load_script(&self, script: &str) -> Result<ScriptHandle>;

    /// Run a loaded script in one atomic round trip.
    ///
    /// Returns [`TurnstileError::ScriptNotLoaded`] when the store has
    /// forgotten `handle`.
    async fn eval(&self, handle: &ScriptHandle, keys: &[String], args: &[i64]) -> Result<Vec<i64>>;
}

#[async_trait]
impl<T: ScriptStore + ?Sized> ScriptStore for Arc<T> {
    async fn load_script(&self, script: &str) -> Result<ScriptHandle> {
        (**self).load_script(script).await
    }

    async fn eval(&self, handle: &ScriptHandle, keys: &[String], args: &[i64]) -> Result<Vec<i64>> {
        (**self).eval(handle, keys, args).await
    }
}

/// Tiered limiter whose state lives in a shared [`ScriptStore`].
pub struct SharedStoreLimiter<S> {
    store: S,
    policy: TierPolicy,
    prefix: String,
    script: RwLock<Option<ScriptHandle>>,
    clock: Arc<dyn Clock>,
}

impl<S: ScriptStore> SharedStoreLimiter<S> {
    /// Create a limiter applying `policy` through `store`.
    pub fn new(store: S, policy: TierPolicy) -> Self {
        Self {
            store,
            policy,
            prefix: DEFAULT_KEY_PREFIX.to_string(),
            script: RwLock::new(None),
            clock: system_clock(),
        }
    }

    /// Use a different key prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Read time from `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The window and status keys for `identifier`.
    pub fn keys(&self, identifier: &str) -> Vec<String> {
        let window = format!("{}{}", self.prefix, identifier);
        let status = format!("{}{}", window, STATUS_KEY_SUFFIX);
        vec![window, status]
    }

    /// The policy being applied.
    pub fn policy(&self) -> &TierPolicy {
        &self.policy
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Count one request for `identifier` against the shared state.
    ///
    /// A stale script handle is reloaded and the evaluation retried once; a
    /// transient backend failure is retried once. Anything still failing is
    /// returned as an error, never as a denial.
    pub async fn check(&self, identifier: &str) -> Result<RateLimitStatus> {
        let now = self.clock.now();
        let keys = self.keys(identifier);
        let mut args = Vec::with_capacity(1 + self.policy.len() * 2);
        args.push(now.timestamp_millis());
        args.extend(self.policy.to_args());

        trace!(identifier = %identifier, "Checking shared rate limit");

        let reply = match self.eval(&keys, &args).await {
            Ok(reply) => reply,
            Err(TurnstileError::ScriptNotLoaded) => {
                warn!(identifier = %identifier, "Shared store lost the tier script, reloading");
                self.reload_script().await?;
                self.eval(&keys, &args).await?
            }
            Err(err) if err.is_recoverable() => {
                warn!(identifier = %identifier, error = %err, "Shared store check failed, retrying once");
                self.eval(&keys, &args).await?
            }
            Err(err) => return Err(err),
        };

        let status = parse_reply(&reply, now)?;
        if !status.allowed {
            debug!(identifier = %identifier, total = status.total, "Shared rate limit exceeded");
        }
        Ok(status)
    }

    async fn eval(&self, keys: &[String], args: &[i64]) -> Result<Vec<i64>> {
        let handle = self.script_handle().await?;
        self.store.eval(&handle, keys, args).await
    }

    async fn script_handle(&self) -> Result<ScriptHandle> {
        let cached = self.script.read().clone();
        match cached {
            Some(handle) => Ok(handle),
            None => self.reload_script().await,
        }
    }

    async fn reload_script(&self) -> Result<ScriptHandle> {
        let handle = self.store.load_script(TIERED_SCRIPT).await?;
        debug!(handle = %handle, "Loaded tier script");
        *self.script.write() = Some(handle.clone());
        Ok(handle)
    }
}

impl<S> std::fmt::Debug for SharedStoreLimiter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStoreLimiter")
            .field("policy", &self.policy)
            .field("prefix", &self.prefix)
            .finish()
    }
}

#[async_trait]
impl<S: ScriptStore> RateLimiterStore for SharedStoreLimiter<S> {
    async fn check(&self, identifier: &str) -> Result<RateLimitStatus> {
        SharedStoreLimiter::check(self, identifier).await
    }
}

/// Decode a `[remaining, total, duration_ms, reset_ms]` script reply.
fn parse_reply(reply: &[i64], now: DateTime<Utc>) -> Result<RateLimitStatus> {
    let &[remaining, total, duration_ms, reset_ms] = reply else {
        return Err(TurnstileError::Backend(format!(
            "malformed script reply: expected 4 values, got {}",
            reply.len()
        )));
    };

    if total <= 0 || duration_ms <= 0 || remaining < -1 {
        return Err(TurnstileError::Backend(format!(
            "malformed script reply: {:?}",
            reply
        )));
    }
    let reset_time = Utc
        .timestamp_millis_opt(reset_ms)
        .single()
        .ok_or_else(|| TurnstileError::Backend(format!("invalid reset time {}", reset_ms)))?;

    let allowed = remaining >= 0;
    Ok(RateLimitStatus {
        allowed,
        total: total as u64,
        remaining,
        duration: Duration::from_millis(duration_ms as u64),
        reset_time,
        retry_after: if allowed {
            Duration::ZERO
        } else {
            elapsed_between(now, reset_time)
        },
    })
}

/// In-process [`ScriptStore`] that understands [`TIERED_SCRIPT`].
///
/// Every evaluation runs under one lock, which gives the same atomicity a
/// scripted external store would. Handles are random UUIDs;
/// [`flush_scripts`](Self::flush_scripts) and
/// [`set_available`](Self::set_available) reproduce the failure modes of a
/// real store.
pub struct MemoryScriptStore {
    state: Mutex<MemoryState>,
    clock: Arc<dyn Clock>,
}

struct MemoryState {
    scripts: HashMap<ScriptHandle, String>,
    windows: HashMap<String, TierWindow>,
    statuses: HashMap<String, TierStatus>,
    available: bool,
    next_sweep: Option<DateTime<Utc>>,
}

impl MemoryState {
    fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.windows.len() + self.statuses.len();
        self.windows.retain(|_, window| window.reset_time > now);
        self.statuses.retain(|_, status| status.expires_at > now);
        before - self.windows.len() - self.statuses.len()
    }
}

impl MemoryScriptStore {
    /// Create an empty store using the system clock for sweeps.
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// Create an empty store reading sweep time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                scripts: HashMap::new(),
                windows: HashMap::new(),
                statuses: HashMap::new(),
                available: true,
                next_sweep: None,
            }),
            clock,
        }
    }

    /// Forget every loaded script, invalidating all handles.
    pub fn flush_scripts(&self) {
        self.state.lock().scripts.clear();
    }

    /// Simulate the store going away or coming back.
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    /// Number of scripts currently loaded.
    pub fn script_count(&self) -> usize {
        self.state.lock().scripts.len()
    }

    /// Number of window and status keys stored.
    pub fn key_count(&self) -> usize {
        let state = self.state.lock();
        state.windows.len() + state.statuses.len()
    }

    fn run_tiered(state: &mut MemoryState, keys: &[String], args: &[i64]) -> Result<Vec<i64>> {
        let [window_key, status_key] = keys else {
            return Err(TurnstileError::Backend(format!(
                "tier script expects 2 keys, got {}",
                keys.len()
            )));
        };
        let (&now_ms, tier_args) = args
            .split_first()
            .ok_or_else(|| TurnstileError::Policy("missing timestamp argument".to_string()))?;
        let policy = TierPolicy::from_args(tier_args)?;
        let now = Utc
            .timestamp_millis_opt(now_ms)
            .single()
            .ok_or_else(|| TurnstileError::Backend(format!("invalid timestamp {}", now_ms)))?;

        let mut slot = TierSlot {
            window: state.windows.remove(window_key),
            status: state.statuses.remove(status_key),
        };
        // Expired keys are dropped lazily, once per status lifetime.
        let sweep_every = policy.longest_duration() * 2;
        let status = MultiTierPolicyResolver::new(policy).resolve(&mut slot, now);

        if let Some(window) = slot.window {
            state.windows.insert(window_key.clone(), window);
        }
        if let Some(tier_status) = slot.status {
            state.statuses.insert(status_key.clone(), tier_status);
        }

        let due = state.next_sweep;
        match due {
            Some(due) if now < due => {}
            Some(_) => {
                let removed = state.sweep(now);
                if removed > 0 {
                    trace!(removed, "Evicted expired shared keys");
                }
                state.next_sweep = Some(add_duration(now, sweep_every));
            }
            None => state.next_sweep = Some(add_duration(now, sweep_every)),
        }

        Ok(vec![
            status.remaining,
            status.total as i64,
            status.duration.as_millis() as i64,
            status.reset_time.timestamp_millis(),
        ])
    }
}

impl Default for MemoryScriptStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryScriptStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryScriptStore")
            .field("scripts", &self.script_count())
            .field("keys", &self.key_count())
            .finish()
    }
}

#[async_trait]
impl ScriptStore for MemoryScriptStore {
    async fn load_script(&self, script: &str) -> Result<ScriptHandle> {
        let mut state = self.state.lock();
        if !state.available {
            return Err(TurnstileError::Backend("store unavailable".to_string()));
        }
        if script != TIERED_SCRIPT {
            return Err(TurnstileError::Backend("unsupported script".to_string()));
        }

        let handle = ScriptHandle::new(Uuid::new_v4().to_string());
        state.scripts.insert(handle.clone(), script.to_owned());
        Ok(handle)
    }

    async fn eval(&self, handle: &ScriptHandle, keys: &[String], args: &[i64]) -> Result<Vec<i64>> {
        let mut state = self.state.lock();
        if !state.available {
            return Err(TurnstileError::Backend("store unavailable".to_string()));
        }
        if !state.scripts.contains_key(handle) {
            return Err(TurnstileError::ScriptNotLoaded);
        }
        Self::run_tiered(&mut state, keys, args)
    }
}

impl Sweep for MemoryScriptStore {
    fn sweep(&self) -> usize {
        let now = self.clock.now();
        let removed = self.state.lock().sweep(now);
        if removed > 0 {
            debug!(removed, "Evicted expired shared keys");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::tiers::PolicyTier;
    use futures::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::{assert_err, assert_ok};

    fn escalating() -> TierPolicy {
        TierPolicy::new(vec![
            PolicyTier::new(3, Duration::from_secs(10)),
            PolicyTier::new(1, Duration::from_secs(20)),
        ])
        .unwrap()
    }

    fn limiter(
        store: Arc<MemoryScriptStore>,
        policy: TierPolicy,
    ) -> (SharedStoreLimiter<Arc<MemoryScriptStore>>, ManualClock) {
        let clock = ManualClock::starting_now();
        let limiter = SharedStoreLimiter::new(store, policy).with_clock(Arc::new(clock.clone()));
        (limiter, clock)
    }

    /// Fails the first `failures` evaluations with a transient error.
    struct FlakyStore {
        inner: MemoryScriptStore,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl ScriptStore for FlakyStore {
        async fn load_script(&self, script: &str) -> Result<ScriptHandle> {
            self.inner.load_script(script).await
        }

        async fn eval(&self, handle: &ScriptHandle, keys: &[String], args: &[i64]) -> Result<Vec<i64>> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(TurnstileError::Backend("connection reset".to_string()));
            }
            self.inner.eval(handle, keys, args).await
        }
    }

    #[test]
    fn test_keys() {
        let store = Arc::new(MemoryScriptStore::new());
        let (limiter, _) = limiter(store, escalating());
        assert_eq!(limiter.keys("10.1.1.1"), vec!["LIMIT:10.1.1.1", "LIMIT:10.1.1.1:S"]);

        let limiter = limiter.with_prefix("api:");
        assert_eq!(limiter.keys("k"), vec!["api:k", "api:k:S"]);
    }

    #[test]
    fn test_script_follows_resolver_rules() {
        // Same layout and rollover as MultiTierPolicyResolver.
        let rules = [
            "local now = tonumber(ARGV[1])",
            "local tiers = (#ARGV - 1) / 2",
            "tonumber(window[4]) > now",
            "if count >= 0 then",
            "if count == -1 and tiers > 1 then",
            "math.min(tier + 1, tiers), 'PX', duration * 2",
            "math.min(tonumber(redis.call('get', KEYS[2])) or 1, tiers)",
            "local total = tonumber(ARGV[tier * 2])",
            "local duration = tonumber(ARGV[tier * 2 + 1])",
            "'ct', total - 1",
            "return {count, total, duration, reset}",
            "return {total - 1, total, duration, reset}",
        ];
        for rule in rules {
            assert!(TIERED_SCRIPT.contains(rule), "tier script is missing {:?}", rule);
        }
        assert_eq!(TIERED_SCRIPT.matches("return {").count(), 2);
    }

    #[test]
    fn test_parse_reply_rejects_malformed() {
        let now = Utc::now();
        assert!(parse_reply(&[1, 2, 3], now).is_err());
        assert!(parse_reply(&[1, 0, 1000, 0], now).is_err());
        assert!(parse_reply(&[1, 5, 0, 0], now).is_err());
        assert!(parse_reply(&[-2, 5, 1000, 0], now).is_err());

        let status = parse_reply(&[-1, 5, 1000, now.timestamp_millis() + 400], now).unwrap();
        assert!(!status.allowed);
        assert_eq!(status.retry_after, Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_shared_escalation() {
        let store = Arc::new(MemoryScriptStore::new());
        let (limiter, clock) = limiter(store, escalating());

        for _ in 0..3 {
            assert!(limiter.check("a").await.unwrap().allowed);
        }
        let denied = limiter.check("a").await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, -1);

        clock.advance(Duration::from_secs(10));
        let status = limiter.check("a").await.unwrap();
        assert!(status.allowed);
        assert_eq!(status.total, 1);
        assert!(!limiter.check("a").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_reloads_stale_script() {
        let store = Arc::new(MemoryScriptStore::new());
        let (limiter, _) = limiter(store.clone(), escalating());

        assert_ok!(limiter.check("a").await);
        store.flush_scripts();
        assert_eq!(store.script_count(), 0);

        let status = assert_ok!(limiter.check("a").await);
        assert_eq!(status.remaining, 1);
        assert_eq!(store.script_count(), 1);
    }

    #[tokio::test]
    async fn test_outage_is_an_error_not_a_denial() {
        let store = Arc::new(MemoryScriptStore::new());
        let (limiter, _) = limiter(store.clone(), escalating());

        store.set_available(false);
        let err = assert_err!(limiter.check("a").await);
        assert!(err.is_recoverable());

        store.set_available(true);
        assert!(assert_ok!(limiter.check("a").await).allowed);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_once() {
        let policy = escalating();
        let flaky = FlakyStore {
            inner: MemoryScriptStore::new(),
            failures: AtomicUsize::new(1),
        };
        let limiter = SharedStoreLimiter::new(flaky, policy.clone());
        assert_ok!(limiter.check("a").await);

        let flaky = FlakyStore {
            inner: MemoryScriptStore::new(),
            failures: AtomicUsize::new(2),
        };
        let limiter = SharedStoreLimiter::new(flaky, policy);
        assert_err!(limiter.check("a").await);
    }

    #[tokio::test]
    async fn test_malformed_args_reported() {
        let store = MemoryScriptStore::new();
        let handle = store.load_script(TIERED_SCRIPT).await.unwrap();
        let keys = vec!["LIMIT:a".to_string(), "LIMIT:a:S".to_string()];
        let now = Utc::now().timestamp_millis();

        let result = store.eval(&handle, &keys, &[now, 5]).await;
        assert!(matches!(result, Err(TurnstileError::Policy(_))));

        let result = store.eval(&handle, &keys[..1], &[now, 5, 1000]).await;
        assert!(matches!(result, Err(TurnstileError::Backend(_))));
    }

    #[tokio::test]
    async fn test_unknown_script_rejected() {
        let store = MemoryScriptStore::new();
        assert_err!(store.load_script("return 1").await);
    }

    #[tokio::test]
    async fn test_instances_share_state() {
        let store = Arc::new(MemoryScriptStore::new());
        let policy = TierPolicy::single(4, Duration::from_secs(60)).unwrap();
        let first = SharedStoreLimiter::new(store.clone(), policy.clone());
        let second = SharedStoreLimiter::new(store, policy);

        assert!(first.check("a").await.unwrap().allowed);
        assert!(second.check("a").await.unwrap().allowed);
        assert!(first.check("a").await.unwrap().allowed);
        let status = second.check("a").await.unwrap();
        assert!(status.allowed);
        assert_eq!(status.remaining, 0);
        assert!(!first.check("a").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_concurrent_checks_never_overcount() {
        let store = Arc::new(MemoryScriptStore::new());
        let policy = TierPolicy::single(10, Duration::from_secs(60)).unwrap();
        let limiter = Arc::new(SharedStoreLimiter::new(store, policy));

        let tasks = (0..25).map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.check("hot").await.unwrap().allowed })
        });
        let allowed = join_all(tasks)
            .await
            .into_iter()
            .filter(|res| *res.as_ref().unwrap())
            .count();

        assert_eq!(allowed, 10);
    }

    #[tokio::test]
    async fn test_expired_keys_evicted_without_sweeper() {
        let clock = ManualClock::starting_now();
        let store = Arc::new(MemoryScriptStore::with_clock(Arc::new(clock.clone())));
        let policy = TierPolicy::single(1, Duration::from_millis(10)).unwrap();
        let limiter = SharedStoreLimiter::new(store.clone(), policy).with_clock(Arc::new(clock.clone()));

        for i in 0..1000 {
            assert!(limiter.check(&format!("client-{}", i)).await.unwrap().allowed);
            clock.advance(Duration::from_secs(1));
        }

        assert!(store.key_count() <= 2);
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_keys() {
        let clock = ManualClock::starting_now();
        let store = Arc::new(MemoryScriptStore::with_clock(Arc::new(clock.clone())));
        let limiter = SharedStoreLimiter::new(store.clone(), escalating())
            .with_clock(Arc::new(clock.clone()));

        for _ in 0..4 {
            limiter.check("a").await.unwrap();
        }
        assert_eq!(store.key_count(), 2);

        clock.advance(Duration::from_secs(11));
        assert_eq!(store.sweep(), 1);

        clock.advance(Duration::from_secs(10));
        assert_eq!(store.sweep(), 1);
        assert_eq!(store.key_count(), 0);
    }
}
