use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio_test::assert_ok;
use turnstile::ratelimit::{
    ManualClock, MemoryScriptStore, PolicyTier, RateLimiterStore, SharedStoreLimiter, TierPolicy,
    TieredTable,
};

fn escalating() -> TierPolicy {
    TierPolicy::new(vec![
        PolicyTier::new(3, Duration::from_secs(10)),
        PolicyTier::new(1, Duration::from_secs(20)),
    ])
    .unwrap()
}

#[test]
fn test_escalation_and_cool_down_window() {
    let clock = ManualClock::starting_now();
    let table = TieredTable::with_clock(escalating(), Arc::new(clock.clone()));

    for _ in 0..3 {
        assert!(table.allow("10.0.0.1"));
    }
    let denied = table.check("10.0.0.1");
    assert!(!denied.allowed);
    assert_eq!(denied.total, 3);

    // First window over, status entry (2 x 10s) still live.
    clock.advance(Duration::from_secs(10));
    let status = table.check("10.0.0.1");
    assert!(status.allowed);
    assert_eq!(status.total, 1);
    assert_eq!(status.duration, Duration::from_secs(20));
    assert!(!table.allow("10.0.0.1"));
}

#[test]
fn test_status_expiry_returns_to_first_tier() {
    let clock = ManualClock::starting_now();
    let table = TieredTable::with_clock(escalating(), Arc::new(clock.clone()));

    for _ in 0..4 {
        table.check("a");
    }

    clock.advance(Duration::from_secs(21));
    let status = table.check("a");
    assert!(status.allowed);
    assert_eq!(status.total, 3);
}

#[tokio::test]
async fn test_shared_store_matches_in_memory_tiers() {
    let clock = ManualClock::starting_now();
    let table = TieredTable::with_clock(escalating(), Arc::new(clock.clone()));
    let shared = SharedStoreLimiter::new(Arc::new(MemoryScriptStore::new()), escalating())
        .with_clock(Arc::new(clock.clone()));

    // seconds to wait before each request
    let trace = [0, 0, 0, 0, 0, 10, 0, 5, 15, 0, 30, 0, 0, 0, 0, 60, 0];

    for wait in trace {
        clock.advance(Duration::from_secs(wait));
        let local = table.check("client");
        let remote = assert_ok!(shared.check("client").await);

        assert_eq!(local.allowed, remote.allowed);
        assert_eq!(local.remaining, remote.remaining);
        assert_eq!(local.total, remote.total);
        assert_eq!(local.duration, remote.duration);
    }
}

#[tokio::test]
async fn test_concurrent_shared_checks() {
    let store = Arc::new(MemoryScriptStore::new());
    let policy = TierPolicy::single(7, Duration::from_secs(60)).unwrap();
    let limiters: Vec<Arc<dyn RateLimiterStore>> = (0..3)
        .map(|_| {
            Arc::new(SharedStoreLimiter::new(store.clone(), policy.clone()))
                as Arc<dyn RateLimiterStore>
        })
        .collect();

    let checks = (0..30).map(|i| {
        let limiter = limiters[i % limiters.len()].clone();
        async move { limiter.allow("burst").await.unwrap() }
    });
    let allowed = join_all(checks).await.into_iter().filter(|ok| *ok).count();

    assert_eq!(allowed, 7);
}
