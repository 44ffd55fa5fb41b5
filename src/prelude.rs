//! Convenient re-exports for wiring admission control into a service.
pub use crate::{
    config::{AdmissionConfig, ConfigError},
    guard::{Admission, AdmissionGuard, AdmissionRequest, PolicyTable, RateLimitInfo, Rejection},
    identity::TrustConfig,
    rate_limit::{
        AdmissionLayer, CounterStore, FallbackMode, InMemoryCounterStore, PeerAddr, Policy,
        RateLimitRecord, SlidingWindowLimiter,
    },
    telemetry::{AdmissionEvent, BoxedSink, LogSink, MemorySink, NullSink},
    AdmissionError, LimiterError,
};
