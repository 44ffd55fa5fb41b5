//! Bulkhead implementation for concurrency limiting
//!
//! Bounds in-flight counter-store operations. Callers over the limit wait (without
//! blocking a thread) in FIFO order; tokio's semaphore hands a released permit to the
//! longest-waiting acquirer, never to a caller that arrives later.

use crate::ResilienceError;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone)]
pub struct BulkheadPolicy {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

/// A held bulkhead slot. The slot is returned when this is dropped, including on
/// early return, error, panic or cancellation of the holder.
#[derive(Debug)]
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
}

impl BulkheadPolicy {
    /// Create a bulkhead admitting `max_concurrent` operations at once.
    /// Values above the semaphore's capacity are clamped.
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.min(Semaphore::MAX_PERMITS);
        Self { semaphore: Arc::new(Semaphore::new(max_concurrent)), max_concurrent }
    }

    pub fn unlimited() -> Self {
        Self::new(Semaphore::MAX_PERMITS)
    }

    /// Configured ceiling.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Permits not currently held.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Operations currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.max_concurrent.saturating_sub(self.available())
    }

    /// Wait for a slot.
    pub async fn acquire<E>(&self) -> Result<BulkheadPermit, ResilienceError<E>> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ResilienceError::BulkheadClosed)?;
        Ok(BulkheadPermit { _permit: permit })
    }

    /// Run `operation` while holding a slot, waiting for one if all are taken.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let permit = self.acquire::<E>().await?;
        if self.available() == 0 {
            tracing::debug!(max = self.max_concurrent, "Bulkhead saturated");
        }
        let result = operation().await;
        drop(permit);
        result
    }
}
