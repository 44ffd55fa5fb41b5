//! Counter storage behind the sliding-window limiter.
//!
//! A [`CounterStore`] applies one [`WindowHit`] atomically: purge, count, compare,
//! record and expire happen as a single indivisible step per key, so concurrent
//! checks on the same key can never both observe "one slot left".

use super::window::{SlidingWindow, WindowHit, WindowReply};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// Failure talking to a counter store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
    /// The command did not complete in time.
    #[error("counter store command timed out after {elapsed:?} (limit: {timeout:?})")]
    Timeout { elapsed: Duration, timeout: Duration },
    /// The store answered, but not with the expected reply shape.
    #[error("unexpected counter store reply: {0}")]
    Protocol(String),
    /// Client-library error.
    #[error("counter store error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    /// Wrap a client-library error.
    pub fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend(Box::new(err))
    }
}

/// Atomic sliding-window counter storage.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically record `hit` against `key` (unless it is blocked) and report the
    /// key's state afterwards.
    async fn increment(&self, key: &str, hit: &WindowHit) -> Result<WindowReply, StoreError>;

    /// Read the key's current state without recording a hit.
    async fn get(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> Result<Option<WindowReply>, StoreError>;

    /// Cheap liveness check.
    async fn is_healthy(&self) -> bool;
}

#[async_trait]
impl<S> CounterStore for Arc<S>
where
    S: CounterStore + ?Sized,
{
    async fn increment(&self, key: &str, hit: &WindowHit) -> Result<WindowReply, StoreError> {
        (**self).increment(key, hit).await
    }

    async fn get(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> Result<Option<WindowReply>, StoreError> {
        (**self).get(key, now_ms, window_ms).await
    }

    async fn is_healthy(&self) -> bool {
        (**self).is_healthy().await
    }
}

/// Keys swept for expiry every this many increments.
const SWEEP_INTERVAL: u64 = 1024;

/// Process-local store. Atomic per process only; use a shared store when several
/// instances must agree on one limit.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCounterStore {
    windows: Arc<Mutex<HashMap<String, SlidingWindow>>>,
    ops: Arc<AtomicU64>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held, expired or not.
    pub fn len(&self) -> usize {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every key whose expiry has passed at `now_ms`.
    pub fn sweep(&self, now_ms: u64) {
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, window| !window.is_expired(now_ms));
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(&self, key: &str, hit: &WindowHit) -> Result<WindowReply, StoreError> {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        if self.ops.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            windows.retain(|_, window| !window.is_expired(hit.now_ms));
        }
        let reply = windows.entry(key.to_owned()).or_default().hit(hit);
        Ok(reply)
    }

    async fn get(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> Result<Option<WindowReply>, StoreError> {
        let windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(windows.get(key).and_then(|window| window.peek(now_ms, window_ms)))
    }

    async fn is_healthy(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(now_ms: u64, member: &str) -> WindowHit {
        WindowHit { now_ms, window_ms: 1_000, limit: 2, block_ms: 0, member: member.into() }
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let store = InMemoryCounterStore::new();
        store.increment("a", &hit(0, "1")).await.unwrap();
        store.increment("a", &hit(0, "2")).await.unwrap();
        let b = store.increment("b", &hit(0, "1")).await.unwrap();
        assert_eq!(b.total_hits, 1);
        assert!(store.increment("a", &hit(0, "3")).await.unwrap().is_blocked);
    }

    #[tokio::test]
    async fn get_reports_missing_and_existing_keys() {
        let store = InMemoryCounterStore::new();
        assert_eq!(store.get("k", 0, 1_000).await.unwrap(), None);
        store.increment("k", &hit(0, "1")).await.unwrap();
        let state = store.get("k", 10, 1_000).await.unwrap().unwrap();
        assert_eq!(state.total_hits, 1);
        assert!(!state.is_blocked);
    }

    #[tokio::test]
    async fn sweep_removes_expired_keys() {
        let store = InMemoryCounterStore::new();
        store.increment("old", &hit(0, "1")).await.unwrap();
        store.increment("new", &hit(900, "1")).await.unwrap();
        store.sweep(1_000);
        assert_eq!(store.len(), 1);
        assert!(store.get("new", 1_000, 1_000).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn shared_through_arc() {
        let store = Arc::new(InMemoryCounterStore::new());
        store.increment("k", &hit(0, "1")).await.unwrap();
        assert!(CounterStore::is_healthy(&store).await);
        assert_eq!(store.get("k", 0, 1_000).await.unwrap().unwrap().total_hits, 1);
    }

    #[test]
    fn backend_errors_keep_their_source() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = StoreError::backend(io);
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("refused"));
    }
}
