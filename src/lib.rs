#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Tollgate
//!
//! Distributed rate limiting and admission control for HTTP services.
//!
//! ## Features
//!
//! - **Sliding-window limiter** evaluated atomically in a shared counter store
//! - **Circuit breaker** isolating the store, with single-trial half-open recovery
//! - **FIFO bulkhead** bounding concurrent store commands
//! - **Fail-open** degradation when the store is unavailable (configurable)
//! - **Spoof-resistant client identity** behind trusted reverse proxies
//! - **Tower middleware** emitting standard `RateLimit-*` and `Retry-After` headers
//!
//! ## Quick Start
//!
//! ```rust
//! use tollgate::{AdmissionGuard, AdmissionRequest, Admission, InMemoryCounterStore, Policy,
//!     PolicyTable, SlidingWindowLimiter, TrustConfig};
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = Policy::new("standard", Duration::from_secs(60), 100)?;
//! let guard = AdmissionGuard::new(
//!     SlidingWindowLimiter::new(InMemoryCounterStore::new()),
//!     PolicyTable::new([policy], "standard")?,
//!     TrustConfig::parse(["10.0.0.0/8"], 1)?,
//! );
//!
//! let headers = http::HeaderMap::new();
//! let request = AdmissionRequest::new("203.0.113.7".parse()?, &headers, "/orders");
//! match guard.admit(&request).await? {
//!     Admission::Allowed(info) => assert_eq!(info.remaining(), 99),
//!     other => panic!("unexpected {other:?}"),
//! }
//! # Ok(())
//! # }
//! ```

pub mod bulkhead;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod guard;
pub mod headers;
pub mod identity;
pub mod prelude;
pub mod rate_limit;
pub mod telemetry;
pub mod timeout;

// Re-exports
pub use bulkhead::{BulkheadPermit, BulkheadPolicy};
pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerPolicy, CircuitState,
};
pub use clock::{Clock, ManualClock, MonotonicClock, SystemClock};
pub use config::{AdmissionConfig, ConfigError, ValidatedConfig};
pub use error::{AdmissionError, LimiterError, ResilienceError};
pub use guard::{Admission, AdmissionGuard, AdmissionRequest, PolicyTable, RateLimitInfo, Rejection};
pub use identity::{Identity, TrustConfig, TrustedProxy, UserAgentMatcher};
pub use rate_limit::{
    AdmissionLayer, AdmissionService, AdmissionServiceError, CounterStore, FallbackMode,
    InMemoryCounterStore, PeerAddr, Policy, RateLimitRecord, SlidingWindowLimiter,
    SlidingWindowLimiterBuilder, StoreError, Tier, WindowHit, WindowReply,
};
pub use timeout::TimeoutPolicy;
