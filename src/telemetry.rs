//! Telemetry for the admission path.
//!
//! The limiter and the guard emit an [`AdmissionEvent`] for every decision that is
//! interesting to an operator. Events flow into a sink, which is any
//! `tower::Service<AdmissionEvent>` that never fails. Emission is best-effort: a sink
//! that is not ready simply misses the event and the request path never waits on it.
//!
//! ```rust
//! use tollgate::telemetry::{AdmissionEvent, MemorySink};
//! use tower::Service;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut sink = MemorySink::new();
//! sink.call(AdmissionEvent::Bypassed { policy: "standard".into() }).await.unwrap();
//! assert_eq!(sink.len(), 1);
//! # }
//! ```

use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::util::BoxCloneSyncService;
use tower::Service;

/// Type-erased sink shared by the limiter and the guard.
pub type BoxedSink = BoxCloneSyncService<AdmissionEvent, (), Infallible>;

/// Marker for services usable as admission telemetry sinks.
pub trait TelemetrySink:
    Service<AdmissionEvent, Response = (), Error = Infallible> + Clone + Send + Sync + 'static
{
}

impl<S> TelemetrySink for S
where
    S: Service<AdmissionEvent, Response = (), Error = Infallible> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
{
}

/// Erase a sink's concrete type.
pub fn boxed<S>(sink: S) -> BoxedSink
where
    S: TelemetrySink,
    S::Future: Send + 'static,
{
    BoxCloneSyncService::new(sink)
}

/// Best-effort emit helper that honors `poll_ready` and ignores the outcome.
///
/// Generic over the sink so fallible services (an exporter that can refuse
/// readiness) drop the event instead of erroring.
pub async fn emit_best_effort<S>(sink: &S, event: AdmissionEvent)
where
    S: Service<AdmissionEvent, Response = ()> + Clone,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.clone().ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// Decisions taken on the admission path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionEvent {
    /// The check passed.
    Admitted { policy: Arc<str>, total_hits: u64, limit: u64 },
    /// The caller is over the limit (or serving a penalty).
    Rejected { policy: Arc<str>, total_hits: u64, retry_after: Duration },
    /// The store circuit is open and fail-open is disabled.
    CircuitRejected { policy: Arc<str>, retry_after: Duration },
    /// The store failed and the request was let through anyway.
    FailOpen { policy: Arc<str>, reason: String },
    /// The store failed and fail-open is disabled.
    BackendFailure { policy: Arc<str>, reason: String },
    /// The request skipped rate limiting entirely.
    Bypassed { policy: Arc<str> },
}

impl AdmissionEvent {
    /// Policy the event belongs to.
    pub fn policy(&self) -> &str {
        match self {
            AdmissionEvent::Admitted { policy, .. }
            | AdmissionEvent::Rejected { policy, .. }
            | AdmissionEvent::CircuitRejected { policy, .. }
            | AdmissionEvent::FailOpen { policy, .. }
            | AdmissionEvent::BackendFailure { policy, .. }
            | AdmissionEvent::Bypassed { policy } => policy,
        }
    }
}

impl fmt::Display for AdmissionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionEvent::Admitted { policy, total_hits, limit } => {
                write!(f, "Admitted({policy}, {total_hits}/{limit})")
            }
            AdmissionEvent::Rejected { policy, total_hits, retry_after } => {
                write!(f, "Rejected({policy}, hits={total_hits}, retry_after={retry_after:?})")
            }
            AdmissionEvent::CircuitRejected { policy, retry_after } => {
                write!(f, "CircuitRejected({policy}, retry_after={retry_after:?})")
            }
            AdmissionEvent::FailOpen { policy, reason } => write!(f, "FailOpen({policy}: {reason})"),
            AdmissionEvent::BackendFailure { policy, reason } => {
                write!(f, "BackendFailure({policy}: {reason})")
            }
            AdmissionEvent::Bypassed { policy } => write!(f, "Bypassed({policy})"),
        }
    }
}

type SinkFuture = Pin<Box<dyn std::future::Future<Output = Result<(), Infallible>> + Send>>;

/// Discards every event.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<AdmissionEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: AdmissionEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

/// Logs events through `tracing` at INFO.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<AdmissionEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        tracing::info!(event = %event, policy = event.policy(), "admission_event");
        Box::pin(async { Ok(()) })
    }
}

/// Keeps events in memory, evicting the oldest beyond its capacity.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<AdmissionEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Bounded sink holding at most 10,000 events.
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Snapshot of the retained events, oldest first.
    pub fn events(&self) -> Vec<AdmissionEvent> {
        self.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events dropped to stay within capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<AdmissionEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<AdmissionEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        let mut events = self.lock();
        if events.len() >= self.capacity {
            events.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        events.push_back(event);
        Box::pin(async { Ok(()) })
    }
}
