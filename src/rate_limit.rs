//! Sliding-window rate limiting against a shared counter store.
//!
//! - [`Policy`]: named window, limit and optional penalty.
//! - [`SlidingWindowLimiter`]: runs one atomic check per request through the
//!   breaker, bulkhead and timeout guarding the store.
//! - [`store`]: the storage seam ([`CounterStore`]) and an in-process store.
//! - [`window`]: the algorithm itself.
//! - [`middleware`]: tower layer wiring the admission guard into a service stack.
//!
//! Every check is a single round-trip. The store purges entries older than the
//! window, counts what is left, and either records the hit or reports the key as
//! blocked, all in one indivisible step. Two callers racing for the last slot can
//! therefore never both be admitted.

pub mod middleware;
pub mod store;
pub mod window;

pub use middleware::{AdmissionLayer, AdmissionService, AdmissionServiceError, PeerAddr, Tier};
pub use store::{CounterStore, InMemoryCounterStore, StoreError};
pub use window::{WindowHit, WindowReply};

use crate::bulkhead::BulkheadPolicy;
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerPolicy};
use crate::clock::{Clock, SystemClock};
use crate::config::ConfigError;
use crate::error::LimiterError;
use crate::telemetry::{self, AdmissionEvent, BoxedSink, NullSink};
use crate::timeout::TimeoutPolicy;
use crate::ResilienceError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Key prefix used when none is configured.
pub const DEFAULT_KEY_PREFIX: &str = "rl:";

/// A named rate-limit rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    name: Arc<str>,
    window: Duration,
    limit: u64,
    block_duration: Option<Duration>,
}

impl Policy {
    /// Create a policy. The name becomes part of the counter key, so it must be
    /// non-empty and free of `:`. A `limit` of zero blocks every request.
    pub fn new(name: impl Into<Arc<str>>, window: Duration, limit: u64) -> Result<Self, ConfigError> {
        let name = name.into();
        if name.is_empty() || name.contains(':') {
            return Err(ConfigError::InvalidPolicyName(name.to_string()));
        }
        if window.as_millis() == 0 {
            return Err(ConfigError::ZeroWindow(name.to_string()));
        }
        Ok(Self { name, window, limit, block_duration: None })
    }

    /// Keep a caller blocked for `duration` once the limit is exceeded, rather than
    /// just until the window frees a slot. A zero duration clears the penalty.
    pub fn with_block_duration(mut self, duration: Duration) -> Self {
        self.block_duration = (!duration.is_zero()).then_some(duration);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn shared_name(&self) -> Arc<str> {
        self.name.clone()
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn block_duration(&self) -> Option<Duration> {
        self.block_duration
    }

    pub fn window_ms(&self) -> u64 {
        millis(self.window)
    }

    pub fn block_ms(&self) -> u64 {
        self.block_duration.map_or(0, millis)
    }
}

/// Outcome of one check, as reported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRecord {
    /// Hits currently counted in the window.
    pub total_hits: u64,
    /// Milliseconds until the caller's state resets (penalty or window).
    pub time_to_expire_ms: u64,
    pub is_blocked: bool,
    /// Milliseconds left on the block; 0 when not blocked.
    pub time_to_block_expire_ms: u64,
}

impl RateLimitRecord {
    /// Synthetic record used when the store is unreachable and fail-open applies.
    pub fn fail_open(policy: &Policy) -> Self {
        Self {
            total_hits: 1,
            time_to_expire_ms: policy.window_ms(),
            is_blocked: false,
            time_to_block_expire_ms: 0,
        }
    }

    /// Requests left in the window, never negative.
    pub fn remaining(&self, limit: u64) -> u64 {
        limit.saturating_sub(self.total_hits)
    }

    /// Seconds until reset, rounded up.
    pub fn reset_secs(&self) -> u64 {
        self.time_to_expire_ms.div_ceil(1000)
    }

    /// How long a rejected caller should wait.
    pub fn retry_after(&self) -> Duration {
        let ms = if self.is_blocked { self.time_to_block_expire_ms } else { self.time_to_expire_ms };
        Duration::from_millis(ms)
    }
}

impl From<WindowReply> for RateLimitRecord {
    fn from(reply: WindowReply) -> Self {
        Self {
            total_hits: reply.total_hits,
            time_to_expire_ms: reply.time_to_expire_ms,
            is_blocked: reply.is_blocked,
            time_to_block_expire_ms: reply.time_to_block_expire_ms,
        }
    }
}

/// What [`SlidingWindowLimiter::check`] does when the store cannot answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackMode {
    /// Admit the request with a synthetic record.
    #[default]
    FailOpen,
    /// Surface the failure to the caller.
    FailClosed,
}

impl FallbackMode {
    pub fn from_fail_open(fail_open: bool) -> Self {
        if fail_open {
            FallbackMode::FailOpen
        } else {
            FallbackMode::FailClosed
        }
    }
}

/// Distributed sliding-window limiter.
///
/// Store calls run inside a circuit breaker, then a FIFO bulkhead, then a per-command
/// timeout. While the breaker is open the store is not contacted at all.
pub struct SlidingWindowLimiter<S> {
    store: Arc<S>,
    key_prefix: Arc<str>,
    breaker: CircuitBreakerPolicy,
    bulkhead: BulkheadPolicy,
    timeout: TimeoutPolicy,
    fallback: FallbackMode,
    clock: Arc<dyn Clock>,
    sink: BoxedSink,
}

impl<S> fmt::Debug for SlidingWindowLimiter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlidingWindowLimiter")
            .field("key_prefix", &self.key_prefix)
            .field("breaker", &self.breaker.state())
            .field("bulkhead_in_flight", &self.bulkhead.in_flight())
            .field("timeout", &self.timeout.duration())
            .field("fallback", &self.fallback)
            .finish()
    }
}

impl<S: CounterStore> SlidingWindowLimiter<S> {
    /// Limiter with default guards: `rl:` prefix, 5-failure/30s breaker, 64 concurrent
    /// commands, 250ms command timeout, fail-open.
    pub fn new(store: S) -> Self {
        Self::builder(store).build()
    }

    pub fn builder(store: S) -> SlidingWindowLimiterBuilder<S> {
        SlidingWindowLimiterBuilder::new(store)
    }

    /// Counter key for `identity` under `policy`: `{prefix}{policy}:{identity}`.
    pub fn key_for(&self, policy: &Policy, identity: &str) -> String {
        format!("{}{}:{}", self.key_prefix, policy.name(), identity)
    }

    /// Record a hit for `identity` and report its state.
    ///
    /// Store failures (including an open breaker) are absorbed when the limiter
    /// fails open: the caller gets [`RateLimitRecord::fail_open`]. Otherwise the
    /// failure is returned.
    pub async fn check(&self, identity: &str, policy: &Policy) -> Result<RateLimitRecord, LimiterError> {
        self.check_or_degrade(identity, policy).await.map(|(record, _)| record)
    }

    /// [`check`](Self::check), also reporting whether the record is the fail-open
    /// placeholder rather than a store answer. A degraded check has already
    /// emitted [`AdmissionEvent::FailOpen`].
    pub(crate) async fn check_or_degrade(
        &self,
        identity: &str,
        policy: &Policy,
    ) -> Result<(RateLimitRecord, bool), LimiterError> {
        match self.try_check(identity, policy).await {
            Ok(record) => Ok((record, false)),
            Err(err) => match self.fallback {
                FallbackMode::FailOpen => {
                    tracing::warn!(
                        policy = policy.name(),
                        error = %err,
                        "Rate limiter store unavailable, failing open"
                    );
                    self.emit(AdmissionEvent::FailOpen {
                        policy: policy.shared_name(),
                        reason: err.to_string(),
                    })
                    .await;
                    Ok((RateLimitRecord::fail_open(policy), true))
                }
                FallbackMode::FailClosed => {
                    tracing::error!(policy = policy.name(), error = %err, "Rate limiter store unavailable");
                    if !err.is_circuit_open() {
                        self.emit(AdmissionEvent::BackendFailure {
                            policy: policy.shared_name(),
                            reason: err.to_string(),
                        })
                        .await;
                    }
                    Err(err)
                }
            },
        }
    }

    /// Like [`check`](Self::check) but never applies the fallback.
    pub async fn try_check(&self, identity: &str, policy: &Policy) -> Result<RateLimitRecord, LimiterError> {
        let key = self.key_for(policy, identity);
        let now_ms = self.clock.now_millis();
        let hit = WindowHit {
            now_ms,
            window_ms: policy.window_ms(),
            limit: policy.limit(),
            block_ms: policy.block_ms(),
            member: member_id(now_ms),
        };

        let (store, key, hit) = (&*self.store, key.as_str(), &hit);
        let reply = self
            .guarded(move || async move { store.increment(key, hit).await.map_err(ResilienceError::Inner) })
            .await?;

        let record = RateLimitRecord::from(reply);
        tracing::trace!(
            policy = policy.name(),
            total_hits = record.total_hits,
            blocked = record.is_blocked,
            "Rate limit check"
        );
        Ok(record)
    }

    /// Read `identity`'s current state without recording a hit. `None` when the
    /// identity has no live counter.
    pub async fn inspect(&self, identity: &str, policy: &Policy) -> Result<Option<RateLimitRecord>, LimiterError> {
        let key = self.key_for(policy, identity);
        let now_ms = self.clock.now_millis();
        let window_ms = policy.window_ms();

        let (store, key) = (&*self.store, key.as_str());
        let reply = self
            .guarded(move || async move {
                store.get(key, now_ms, window_ms).await.map_err(ResilienceError::Inner)
            })
            .await?;
        Ok(reply.map(RateLimitRecord::from))
    }

    /// Whether a check would reach the store right now and the store answers.
    pub async fn is_healthy(&self) -> bool {
        if !self.breaker.is_available() {
            return false;
        }
        tokio::time::timeout(self.timeout.duration(), self.store.is_healthy())
            .await
            .unwrap_or(false)
    }

    /// How long a caller rejected by an open breaker should wait.
    pub fn circuit_retry_after(&self, open_for: Duration) -> Duration {
        self.breaker.config().reset_timeout().saturating_sub(open_for).max(Duration::from_secs(1))
    }

    pub fn breaker(&self) -> &CircuitBreakerPolicy {
        &self.breaker
    }

    pub fn bulkhead(&self) -> &BulkheadPolicy {
        &self.bulkhead
    }

    pub fn fallback(&self) -> FallbackMode {
        self.fallback
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    pub(crate) async fn emit(&self, event: AdmissionEvent) {
        telemetry::emit_best_effort(&self.sink, event).await;
    }

    async fn guarded<T, Fut, Op>(&self, operation: Op) -> Result<T, LimiterError>
    where
        T: Send,
        Fut: std::future::Future<Output = Result<T, ResilienceError<StoreError>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let (bulkhead, timeout) = (&self.bulkhead, &self.timeout);
        self.breaker
            .execute(move || async move {
                bulkhead.execute(move || async move { timeout.execute(operation).await }).await
            })
            .await
            .map_err(LimiterError::from)
    }
}

/// Unique sorted-set member: millisecond timestamp plus a random tiebreaker, so two
/// hits in the same millisecond are both counted.
fn member_id(now_ms: u64) -> String {
    format!("{now_ms}-{:016x}", rand::random::<u64>())
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Builder for [`SlidingWindowLimiter`].
pub struct SlidingWindowLimiterBuilder<S> {
    store: S,
    key_prefix: Arc<str>,
    breaker: CircuitBreakerConfig,
    max_concurrency: usize,
    timeout: TimeoutPolicy,
    fallback: FallbackMode,
    clock: Arc<dyn Clock>,
    sink: BoxedSink,
}

impl<S: CounterStore> SlidingWindowLimiterBuilder<S> {
    fn new(store: S) -> Self {
        Self {
            store,
            key_prefix: DEFAULT_KEY_PREFIX.into(),
            breaker: CircuitBreakerConfig::default(),
            max_concurrency: 64,
            timeout: TimeoutPolicy::default(),
            fallback: FallbackMode::FailOpen,
            clock: Arc::new(SystemClock),
            sink: telemetry::boxed(NullSink),
        }
    }

    pub fn key_prefix(mut self, prefix: impl Into<Arc<str>>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = config;
        self
    }

    /// Concurrent store commands allowed; extra callers queue in arrival order.
    pub fn max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Per-command timeout. Zero or `Duration::MAX` keep the default.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        if let Some(timeout) = TimeoutPolicy::new(timeout) {
            self.timeout = timeout;
        }
        self
    }

    pub fn fallback(mut self, fallback: FallbackMode) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn fail_open(self, fail_open: bool) -> Self {
        self.fallback(FallbackMode::from_fail_open(fail_open))
    }

    /// Wall clock supplying window timestamps. Shared by the breaker.
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn telemetry(mut self, sink: BoxedSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn build(self) -> SlidingWindowLimiter<S> {
        SlidingWindowLimiter {
            store: Arc::new(self.store),
            key_prefix: self.key_prefix,
            breaker: CircuitBreakerPolicy::from_validated(self.breaker)
                .with_shared_clock(self.clock.clone()),
            bulkhead: BulkheadPolicy::new(self.max_concurrency),
            timeout: self.timeout,
            fallback: self.fallback,
            clock: self.clock,
            sink: self.sink,
        }
    }
}
