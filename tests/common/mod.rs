#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tollgate::rate_limit::{CounterStore, InMemoryCounterStore, StoreError, WindowHit, WindowReply};

/// In-memory store that can be told to fail, and counts how often it is called.
#[derive(Debug, Clone, Default)]
pub struct FlakyStore {
    inner: InMemoryCounterStore,
    failing: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn enter(&self) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CounterStore for FlakyStore {
    async fn increment(&self, key: &str, hit: &WindowHit) -> Result<WindowReply, StoreError> {
        self.enter()?;
        self.inner.increment(key, hit).await
    }

    async fn get(&self, key: &str, now_ms: u64, window_ms: u64) -> Result<Option<WindowReply>, StoreError> {
        self.enter()?;
        self.inner.get(key, now_ms, window_ms).await
    }

    async fn is_healthy(&self) -> bool {
        !self.failing.load(Ordering::SeqCst)
    }
}

/// Route `tracing` output to the test harness. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
