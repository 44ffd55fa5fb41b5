use std::sync::Arc;
use std::time::Duration;
use tollgate::{Policy, SlidingWindowLimiter};
use tollgate_redis::{RedisCounterStore, RedisStoreOptions};

// Requires Redis running. If TOLLGATE_TEST_REDIS_URL is unset, the tests skip.
async fn store() -> Option<RedisCounterStore> {
    let url = match std::env::var("TOLLGATE_TEST_REDIS_URL") {
        Ok(v) => v,
        Err(_) => {
            eprintln!("skipping: set TOLLGATE_TEST_REDIS_URL (e.g. redis://127.0.0.1:6379)");
            return None;
        }
    };
    let store = RedisCounterStore::connect(&url, &RedisStoreOptions::default())
        .await
        .unwrap_or_else(|e| panic!("Failed to connect to redis at '{}': {}", url, e));
    Some(store)
}

fn unique_prefix() -> String {
    format!("tollgate-test:{:016x}:", rand::random::<u64>())
}

#[tokio::test]
async fn counts_blocks_and_inspects() {
    let Some(store) = store().await else { return };
    let limiter = SlidingWindowLimiter::builder(store)
        .key_prefix(unique_prefix())
        .fail_open(false)
        .command_timeout(Duration::from_secs(2))
        .build();
    let policy = Policy::new("standard", Duration::from_secs(10), 3).unwrap();

    for expected in 1..=3 {
        let record = limiter.check("192.0.2.1", &policy).await.expect("check");
        assert_eq!(record.total_hits, expected);
        assert!(!record.is_blocked);
    }
    let blocked = limiter.check("192.0.2.1", &policy).await.expect("check");
    assert!(blocked.is_blocked);
    assert_eq!(blocked.total_hits, 3);
    assert!(blocked.time_to_expire_ms > 0 && blocked.time_to_expire_ms <= 10_000);

    let first = limiter.inspect("192.0.2.1", &policy).await.expect("inspect").expect("present");
    let second = limiter.inspect("192.0.2.1", &policy).await.expect("inspect").expect("present");
    assert_eq!(first.total_hits, 3);
    assert_eq!(second.total_hits, 3);

    assert!(limiter.inspect("192.0.2.99", &policy).await.expect("inspect").is_none());
    assert!(limiter.is_healthy().await);
}

#[tokio::test]
async fn penalty_block_outlasts_the_window() {
    let Some(store) = store().await else { return };
    let limiter = SlidingWindowLimiter::builder(store)
        .key_prefix(unique_prefix())
        .fail_open(false)
        .command_timeout(Duration::from_secs(2))
        .build();
    let policy = Policy::new("auth", Duration::from_secs(1), 1)
        .unwrap()
        .with_block_duration(Duration::from_secs(30));

    assert!(!limiter.check("198.51.100.4", &policy).await.unwrap().is_blocked);
    let blocked = limiter.check("198.51.100.4", &policy).await.unwrap();
    assert!(blocked.is_blocked);
    assert!(blocked.time_to_block_expire_ms > 1_000);
}

#[tokio::test]
async fn concurrent_checks_never_over_admit() {
    let Some(store) = store().await else { return };
    let limiter = Arc::new(
        SlidingWindowLimiter::builder(store)
            .key_prefix(unique_prefix())
            .fail_open(false)
            .command_timeout(Duration::from_secs(2))
            .build(),
    );
    let policy = Arc::new(Policy::new("standard", Duration::from_secs(10), 5).unwrap());

    let mut handles = Vec::new();
    for _ in 0..20 {
        let limiter = limiter.clone();
        let policy = policy.clone();
        handles.push(tokio::spawn(async move { limiter.check("203.0.113.8", &policy).await }));
    }
    let mut admitted = 0;
    for handle in handles {
        if !handle.await.unwrap().unwrap().is_blocked {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 5);
}
