//! Command-level timeout for counter-store calls.
//!
//! Known limitation: the timeout only abandons the local future. A command already
//! written to the store may still run there, so a hit can be recorded server-side
//! even though the caller saw a timeout.

use crate::ResilienceError;
use std::future::Future;
use std::time::{Duration, Instant};

/// Timeout applied when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct TimeoutPolicy {
    duration: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self { duration: DEFAULT_TIMEOUT }
    }
}

impl TimeoutPolicy {
    /// Create a timeout policy. Returns `None` if duration is zero or `Duration::MAX`.
    pub fn new(duration: Duration) -> Option<Self> {
        (duration > Duration::ZERO && duration < Duration::MAX).then_some(Self { duration })
    }

    /// Inspect the configured timeout duration.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let start = Instant::now();

        match tokio::time::timeout(self.duration, operation()).await {
            Ok(result) => result,
            Err(_) => {
                let elapsed = start.elapsed();
                tracing::debug!(?elapsed, timeout = ?self.duration, "Store command timed out");
                Err(ResilienceError::Timeout { elapsed, timeout: self.duration })
            }
        }
    }
}
