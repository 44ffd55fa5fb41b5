//! Error types for the resilience primitives and the admission path.
use crate::rate_limit::store::StoreError;
use std::time::Duration;
use thiserror::Error;

/// Unified error type for the resilience primitives wrapping store calls.
#[derive(Debug, Clone, Error)]
pub enum ResilienceError<E> {
    /// The operation exceeded the timeout duration
    #[error("operation timed out after {elapsed:?} (limit: {timeout:?})")]
    Timeout { elapsed: Duration, timeout: Duration },
    /// The circuit breaker is open
    #[error("circuit breaker open ({failure_count} failures, open for {open_for:?})")]
    CircuitOpen { failure_count: usize, open_for: Duration },
    /// The bulkhead semaphore was closed while waiting for a permit
    #[error("bulkhead closed")]
    BulkheadClosed,
    /// The underlying operation failed
    #[error("{0}")]
    Inner(#[source] E),
}

impl<E> ResilienceError<E> {
    /// Check if this error is due to timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
    /// Check if this error is due to circuit breaker
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
    /// Check if this error wraps an inner error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }
    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
    /// Access circuit-open elapsed duration if present.
    pub fn circuit_open_duration(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { open_for, .. } => Some(*open_for),
            _ => None,
        }
    }
}

/// Failure of a single rate-limit check against the counter store.
#[derive(Debug, Error)]
pub enum LimiterError {
    /// The breaker is isolating the store; the store was not contacted.
    #[error("counter store circuit open ({failure_count} failures, open for {open_for:?})")]
    CircuitOpen { failure_count: usize, open_for: Duration },
    /// The store failed or timed out.
    #[error("counter store unavailable: {0}")]
    BackendUnavailable(#[source] StoreError),
}

impl LimiterError {
    /// Whether this is a fast-fail from an open breaker.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

impl From<ResilienceError<StoreError>> for LimiterError {
    fn from(err: ResilienceError<StoreError>) -> Self {
        match err {
            ResilienceError::CircuitOpen { failure_count, open_for } => {
                LimiterError::CircuitOpen { failure_count, open_for }
            }
            ResilienceError::Timeout { elapsed, timeout } => {
                LimiterError::BackendUnavailable(StoreError::Timeout { elapsed, timeout })
            }
            ResilienceError::BulkheadClosed => {
                LimiterError::BackendUnavailable(StoreError::Unavailable("bulkhead closed".into()))
            }
            ResilienceError::Inner(e) => LimiterError::BackendUnavailable(e),
        }
    }
}

/// Failure of the admission path itself, as opposed to a rejection.
///
/// Only raised when fail-open is disabled; maps to a 5xx response.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("rate limiter backend unavailable for policy '{policy}': {source}")]
    BackendUnavailable {
        policy: String,
        #[source]
        source: StoreError,
    },
}

impl AdmissionError {
    /// Status code the framework should answer with.
    pub fn status(&self) -> http::StatusCode {
        match self {
            AdmissionError::BackendUnavailable { .. } => http::StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}
