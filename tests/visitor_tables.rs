use std::sync::Arc;
use std::thread;
use std::time::Duration;

use turnstile::ratelimit::{
    BucketConfig, ManualClock, RateLimitStatus, ShardedVisitorTable, VisitorTable,
    DEFAULT_EXPIRES_IN, DEFAULT_SHARD_COUNT,
};

fn config(rate: f64, burst: u32) -> BucketConfig {
    BucketConfig::new(rate, burst).unwrap()
}

fn table(rate: f64, burst: u32, expires_in: Duration) -> (VisitorTable, ManualClock) {
    let clock = ManualClock::starting_now();
    let table =
        VisitorTable::with_clock(config(rate, burst), expires_in, Arc::new(clock.clone())).unwrap();
    (table, clock)
}

fn sharded(rate: f64, burst: u32, expires_in: Duration) -> (ShardedVisitorTable, ManualClock) {
    let clock = ManualClock::starting_now();
    let table = ShardedVisitorTable::with_clock(
        config(rate, burst),
        expires_in,
        DEFAULT_SHARD_COUNT,
        Arc::new(clock.clone()),
    )
    .unwrap();
    (table, clock)
}

#[test]
fn test_burst_then_single_refill() {
    let (table, clock) = table(1.0, 3, DEFAULT_EXPIRES_IN);

    let decisions: Vec<bool> = (0..4).map(|_| table.allow("192.168.0.1")).collect();
    assert_eq!(decisions, vec![true, true, true, false]);

    clock.advance(Duration::from_millis(1000));
    assert!(table.allow("192.168.0.1"));
    assert!(!table.allow("192.168.0.1"));
}

#[test]
fn test_exhausting_one_identifier_leaves_others() {
    let (table, _) = sharded(1.0, 3, DEFAULT_EXPIRES_IN);
    for _ in 0..10 {
        table.allow("A");
    }
    assert!(!table.allow("A"));

    for _ in 0..3 {
        assert!(table.allow("B"));
    }
}

#[test]
fn test_sharded_matches_unsharded() {
    let (plain, plain_clock) = table(2.0, 4, Duration::from_secs(5));
    let (split, split_clock) = sharded(2.0, 4, Duration::from_secs(5));

    // (milliseconds to wait, tokens requested)
    let trace = [
        (0, 1),
        (0, 1),
        (100, 2),
        (0, 1),
        (250, 1),
        (0, 5),
        (400, 1),
        (1_000, 3),
        (6_000, 1),
        (0, 4),
        (0, 0),
        (300, 1),
    ];

    for (wait_ms, tokens) in trace {
        plain_clock.advance(Duration::from_millis(wait_ms));
        split_clock.advance(Duration::from_millis(wait_ms));

        let expected: RateLimitStatus = plain.check_n("10.0.0.7", tokens);
        let actual = split.check_n("10.0.0.7", tokens);
        assert_eq!(expected.allowed, actual.allowed);
        assert_eq!(expected.remaining, actual.remaining);
        assert_eq!(expected.total, actual.total);
        assert_eq!(expected.retry_after, actual.retry_after);
    }
}

#[test]
fn test_forced_sweep_restores_full_burst() {
    let (table, clock) = sharded(0.01, 3, Duration::from_millis(20));
    for _ in 0..3 {
        assert!(table.allow("client"));
    }
    assert!(!table.allow("client"));

    clock.advance(Duration::from_millis(50));
    assert_eq!(table.sweep(), 1);

    for _ in 0..3 {
        assert!(table.allow("client"));
    }
    assert!(!table.allow("client"));
}

#[test]
fn test_parallel_callers_exceeding_shard_count() {
    let (table, _) = sharded(0.001, 4, DEFAULT_EXPIRES_IN);
    let table = Arc::new(table);
    let callers = DEFAULT_SHARD_COUNT * 4 + 3;

    let handles: Vec<_> = (0..callers)
        .map(|i| {
            let table = table.clone();
            thread::spawn(move || {
                let identifier = format!("10.1.{}.{}", i / 256, i % 256);
                (0..12).filter(|_| table.allow(&identifier)).count()
            })
        })
        .collect();

    let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(allowed, callers * 4);
}

#[test]
fn test_parallel_callers_on_one_identifier() {
    let (table, _) = table(0.001, 25, DEFAULT_EXPIRES_IN);
    let table = Arc::new(table);

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let table = table.clone();
            thread::spawn(move || (0..10).filter(|_| table.allow("shared")).count())
        })
        .collect();

    let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(allowed, 25);
}
