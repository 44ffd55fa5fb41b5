mod common;

use common::FlakyStore;
use std::sync::Arc;
use std::time::Duration;
use tollgate::{InMemoryCounterStore, ManualClock, Policy, SlidingWindowLimiter};

const START: u64 = 1_700_000_000_000;

fn limiter(clock: &ManualClock) -> SlidingWindowLimiter<InMemoryCounterStore> {
    SlidingWindowLimiter::builder(InMemoryCounterStore::new())
        .clock(clock.clone())
        .fail_open(false)
        .build()
}

#[tokio::test]
async fn window_slides_with_the_oldest_hit() {
    let clock = ManualClock::starting_at(START);
    let limiter = limiter(&clock);
    let policy = Policy::new("standard", Duration::from_secs(10), 3).unwrap();

    for _ in 0..3 {
        assert!(!limiter.check("10.0.0.1", &policy).await.unwrap().is_blocked);
        clock.advance(4_000);
    }
    // t = 12s: the t=0 hit has left the window.
    let record = limiter.check("10.0.0.1", &policy).await.unwrap();
    assert!(!record.is_blocked);
    assert_eq!(record.total_hits, 3);

    let blocked = limiter.check("10.0.0.1", &policy).await.unwrap();
    assert!(blocked.is_blocked);
    assert_eq!(blocked.total_hits, 3);
    // Oldest live hit is at t=4s, so a slot frees at t=14s.
    assert_eq!(blocked.time_to_expire_ms, 2_000);
    assert_eq!(blocked.retry_after(), Duration::from_secs(2));
}

#[tokio::test]
async fn rejected_hits_are_not_counted() {
    let clock = ManualClock::starting_at(START);
    let limiter = limiter(&clock);
    let policy = Policy::new("standard", Duration::from_secs(1), 2).unwrap();

    limiter.check("a", &policy).await.unwrap();
    limiter.check("a", &policy).await.unwrap();
    for _ in 0..10 {
        clock.advance(10);
        assert!(limiter.check("a", &policy).await.unwrap().is_blocked);
    }

    // Only the two admitted hits occupy the window; once they age out the
    // caller is admitted again immediately.
    clock.set(START + 1_001);
    let record = limiter.check("a", &policy).await.unwrap();
    assert!(!record.is_blocked);
    assert_eq!(record.total_hits, 1);
}

#[tokio::test]
async fn identities_and_policies_are_isolated() {
    let clock = ManualClock::starting_at(START);
    let limiter = limiter(&clock);
    let standard = Policy::new("standard", Duration::from_secs(60), 1).unwrap();
    let auth = Policy::new("auth", Duration::from_secs(60), 1).unwrap();

    assert!(!limiter.check("10.0.0.1", &standard).await.unwrap().is_blocked);
    assert!(limiter.check("10.0.0.1", &standard).await.unwrap().is_blocked);
    assert!(!limiter.check("10.0.0.2", &standard).await.unwrap().is_blocked);
    assert!(!limiter.check("10.0.0.1", &auth).await.unwrap().is_blocked);
}

#[tokio::test]
async fn penalty_holds_after_the_window_empties() {
    let clock = ManualClock::starting_at(START);
    let limiter = limiter(&clock);
    let policy = Policy::new("auth", Duration::from_secs(60), 2)
        .unwrap()
        .with_block_duration(Duration::from_secs(900));

    limiter.check("attacker", &policy).await.unwrap();
    limiter.check("attacker", &policy).await.unwrap();
    let blocked = limiter.check("attacker", &policy).await.unwrap();
    assert!(blocked.is_blocked);
    assert_eq!(blocked.time_to_block_expire_ms, 900_000);

    clock.advance(120_000);
    let still = limiter.check("attacker", &policy).await.unwrap();
    assert!(still.is_blocked);
    assert_eq!(still.time_to_block_expire_ms, 780_000);

    // Hammering during the penalty does not extend it.
    clock.advance(780_000);
    assert!(!limiter.check("attacker", &policy).await.unwrap().is_blocked);
}

#[tokio::test]
async fn inspect_reports_without_counting() {
    let clock = ManualClock::starting_at(START);
    let limiter = limiter(&clock);
    let policy = Policy::new("standard", Duration::from_secs(60), 5).unwrap();

    assert!(limiter.inspect("10.0.0.9", &policy).await.unwrap().is_none());
    limiter.check("10.0.0.9", &policy).await.unwrap();
    limiter.check("10.0.0.9", &policy).await.unwrap();

    for _ in 0..3 {
        let record = limiter.inspect("10.0.0.9", &policy).await.unwrap().unwrap();
        assert_eq!(record.total_hits, 2);
        assert_eq!(record.remaining(policy.limit()), 3);
    }
    assert_eq!(limiter.check("10.0.0.9", &policy).await.unwrap().total_hits, 3);
}

#[tokio::test]
async fn zero_limit_rejects_everything() {
    let clock = ManualClock::starting_at(START);
    let limiter = limiter(&clock);
    let policy = Policy::new("closed", Duration::from_secs(30), 0).unwrap();

    let record = limiter.check("anyone", &policy).await.unwrap();
    assert!(record.is_blocked);
    assert_eq!(record.total_hits, 0);
    assert_eq!(record.reset_secs(), 30);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_checks_never_over_admit() {
    let limiter = Arc::new(
        SlidingWindowLimiter::builder(InMemoryCounterStore::new())
            .fail_open(false)
            .max_concurrency(4)
            .build(),
    );
    let policy = Arc::new(Policy::new("standard", Duration::from_secs(60), 25).unwrap());

    let handles: Vec<_> = (0..200)
        .map(|_| {
            let limiter = limiter.clone();
            let policy = policy.clone();
            tokio::spawn(async move { limiter.check("203.0.113.7", &policy).await })
        })
        .collect();

    let mut admitted = 0;
    for handle in handles {
        if !handle.await.unwrap().unwrap().is_blocked {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 25);
    assert_eq!(limiter.bulkhead().in_flight(), 0);
}

#[tokio::test]
async fn store_is_contacted_once_per_check() {
    let store = FlakyStore::new();
    let limiter = SlidingWindowLimiter::builder(store.clone()).fail_open(false).build();
    let policy = Policy::new("standard", Duration::from_secs(60), 10).unwrap();

    for _ in 0..4 {
        limiter.check("10.1.1.1", &policy).await.unwrap();
    }
    limiter.inspect("10.1.1.1", &policy).await.unwrap();
    assert_eq!(store.calls(), 5);
}
