//! Circuit breaker implementation with lock-free atomics

use crate::clock::{Clock, MonotonicClock};
use crate::ResilienceError;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the reset timeout elapses.
    Open,
    /// Trial mode: one call at a time tests recovery.
    HalfOpen,
}

impl CircuitState {
    fn to_u8(self) -> u8 {
        match self {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::Open => STATE_OPEN,
            CircuitState::HalfOpen => STATE_HALF_OPEN,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            STATE_CLOSED => CircuitState::Closed,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            // Only the three constants above are ever stored.
            _ => CircuitState::Open,
        }
    }
}

/// Validated configuration for the circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    failure_threshold: usize,
    reset_timeout: Duration,
    success_threshold: usize,
}

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CircuitBreakerError {
    /// Failure threshold must be > 0.
    #[error("failure_threshold must be > 0 (got {provided})")]
    InvalidFailureThreshold {
        /// Value provided by caller.
        provided: usize,
    },
    /// Reset timeout must be > 0 unless breaker disabled.
    #[error("reset_timeout must be > 0 unless breaker is disabled (got {0:?})")]
    InvalidResetTimeout(Duration),
    /// Half-open success threshold must be > 0.
    #[error("success_threshold must be > 0 (got {provided})")]
    InvalidSuccessThreshold {
        /// Value provided by caller.
        provided: usize,
    },
}

impl Default for CircuitBreakerConfig {
    /// Five consecutive failures open the circuit for 30 seconds; one successful
    /// trial closes it.
    fn default() -> Self {
        Self { failure_threshold: 5, reset_timeout: Duration::from_secs(30), success_threshold: 1 }
    }
}

impl CircuitBreakerConfig {
    /// Create a config with validation.
    pub fn new(
        failure_threshold: usize,
        reset_timeout: Duration,
        success_threshold: usize,
    ) -> Result<Self, CircuitBreakerError> {
        let cfg = Self { failure_threshold, reset_timeout, success_threshold };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Creates a disabled circuit breaker that never opens.
    pub fn disabled() -> Self {
        Self { failure_threshold: usize::MAX, reset_timeout: Duration::MAX, success_threshold: 1 }
    }

    /// Consecutive failures before opening from Closed.
    pub fn failure_threshold(&self) -> usize {
        self.failure_threshold
    }

    /// Duration to stay Open before a trial call is let through.
    pub fn reset_timeout(&self) -> Duration {
        self.reset_timeout
    }

    /// Consecutive trial successes needed to close from Half-Open.
    pub fn success_threshold(&self) -> usize {
        self.success_threshold
    }

    fn validate(&self) -> Result<(), CircuitBreakerError> {
        if self.failure_threshold == 0 {
            return Err(CircuitBreakerError::InvalidFailureThreshold { provided: 0 });
        }
        if self.success_threshold == 0 {
            return Err(CircuitBreakerError::InvalidSuccessThreshold { provided: 0 });
        }
        let disabled = self.failure_threshold == usize::MAX;
        if self.reset_timeout == Duration::ZERO && !disabled {
            return Err(CircuitBreakerError::InvalidResetTimeout(self.reset_timeout));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct CircuitBreakerState {
    state: AtomicU8,
    failure_count: AtomicUsize,
    opened_at_millis: AtomicU64,
    trial_in_flight: AtomicBool,
    trial_successes: AtomicUsize,
}

impl CircuitBreakerState {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            failure_count: AtomicUsize::new(0),
            opened_at_millis: AtomicU64::new(0),
            trial_in_flight: AtomicBool::new(false),
            trial_successes: AtomicUsize::new(0),
        }
    }

    fn current(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: CircuitState, to: CircuitState) -> bool {
        self.state
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Releases the half-open trial slot, including when the trial panics or is cancelled.
struct TrialGuard<'a> {
    state: &'a CircuitBreakerState,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        self.state.trial_in_flight.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone)]
/// Circuit breaker guarding calls to one dependency.
///
/// Clones share the same underlying state via `Arc`, so all handles observe and affect the same
/// circuit lifecycle. Separate `new` calls never share state.
pub struct CircuitBreakerPolicy {
    state: Arc<CircuitBreakerState>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakerPolicy {
    /// Create a circuit breaker closing after a single successful trial.
    ///
    /// # Examples
    /// ```
    /// use tollgate::CircuitBreakerPolicy;
    /// use std::time::Duration;
    /// let breaker = CircuitBreakerPolicy::new(5, Duration::from_secs(30)).unwrap();
    /// assert!(breaker.is_available());
    /// ```
    pub fn new(
        failure_threshold: usize,
        reset_timeout: Duration,
    ) -> Result<Self, CircuitBreakerError> {
        Self::with_config(CircuitBreakerConfig::new(failure_threshold, reset_timeout, 1)?)
    }

    /// Create a breaker from an explicit config, validating the values.
    pub fn with_config(config: CircuitBreakerConfig) -> Result<Self, CircuitBreakerError> {
        config.validate()?;
        Ok(Self::from_validated(config))
    }

    /// `CircuitBreakerConfig` can only be built validated, so this cannot fail.
    pub(crate) fn from_validated(config: CircuitBreakerConfig) -> Self {
        Self {
            state: Arc::new(CircuitBreakerState::new()),
            config,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(self, clock: C) -> Self {
        self.with_shared_clock(Arc::new(clock))
    }

    /// Use a clock shared with other components.
    pub fn with_shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Configuration in effect.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. A breaker whose reset timeout has elapsed still reports `Open`
    /// until a caller claims the trial.
    pub fn state(&self) -> CircuitState {
        self.state.current()
    }

    /// Consecutive failures observed since the last reset or success.
    pub fn failure_count(&self) -> usize {
        self.state.failure_count.load(Ordering::Acquire)
    }

    /// Whether a call issued now would be let through. Has no side effects.
    pub fn is_available(&self) -> bool {
        match self.state.current() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                self.open_elapsed() >= self.reset_timeout_millis()
                    && !self.state.trial_in_flight.load(Ordering::Acquire)
            }
            CircuitState::HalfOpen => !self.state.trial_in_flight.load(Ordering::Acquire),
        }
    }

    /// Force the breaker closed and clear its counters.
    pub fn reset(&self) {
        self.state.failure_count.store(0, Ordering::Release);
        self.state.trial_successes.store(0, Ordering::Release);
        self.state.opened_at_millis.store(0, Ordering::Release);
        self.state.state.store(STATE_CLOSED, Ordering::Release);
        tracing::info!("Circuit breaker reset → closed");
    }

    /// Executes the provided async operation under circuit breaker protection.
    ///
    /// # Behavior
    /// - **Closed**: runs the operation. Consecutive failures increment the failure count and
    ///   any success resets it to zero.
    /// - **Open**: rejects with `ResilienceError::CircuitOpen` until `reset_timeout` elapses,
    ///   then lets exactly one trial through.
    /// - **HalfOpen**: one trial in flight at a time; concurrent callers are rejected.
    ///   `success_threshold` consecutive trial successes close the circuit, a trial failure
    ///   reopens it with a fresh timer.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let trial = self.admit::<E>()?;
        let is_trial = trial.is_some();

        let result = operation().await;
        match &result {
            Ok(_) => self.on_success(is_trial),
            Err(_) => self.on_failure(is_trial),
        }
        // Release the trial slot only after the outcome is recorded.
        drop(trial);
        result
    }

    /// Like [`execute`](Self::execute), but answers an open circuit with `fallback()` instead
    /// of an error. Failures of the operation itself are still returned.
    pub async fn execute_with_fallback<T, E, Fut, Op, Fb, FbFut>(
        &self,
        operation: Op,
        fallback: Fb,
    ) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
        Fb: FnOnce() -> FbFut + Send,
        FbFut: Future<Output = T> + Send,
    {
        match self.admit::<E>() {
            Ok(trial) => {
                let is_trial = trial.is_some();
                let result = operation().await;
                match &result {
                    Ok(_) => self.on_success(is_trial),
                    Err(_) => self.on_failure(is_trial),
                }
                drop(trial);
                result
            }
            Err(_) => Ok(fallback().await),
        }
    }

    /// Decide whether a call may proceed. `Ok(Some(_))` means the caller holds the trial slot.
    fn admit<E>(&self) -> Result<Option<TrialGuard<'_>>, ResilienceError<E>> {
        loop {
            match self.state.current() {
                CircuitState::Closed => return Ok(None),
                CircuitState::Open => {
                    let elapsed = self.open_elapsed();
                    if elapsed < self.reset_timeout_millis() {
                        return Err(self.open_error(elapsed));
                    }
                    if self.state.transition(CircuitState::Open, CircuitState::HalfOpen) {
                        self.state.trial_successes.store(0, Ordering::Release);
                        tracing::info!(open_for_ms = elapsed, "Circuit breaker → half-open");
                    }
                    // Whoever won, re-read and compete for the trial slot.
                }
                CircuitState::HalfOpen => {
                    return if self
                        .state
                        .trial_in_flight
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        tracing::debug!("Circuit breaker: half-open trial request");
                        Ok(Some(TrialGuard { state: &self.state }))
                    } else {
                        Err(self.open_error(self.open_elapsed()))
                    };
                }
            }
        }
    }

    fn on_success(&self, is_trial: bool) {
        match self.state.current() {
            CircuitState::HalfOpen if is_trial => {
                let successes = self.state.trial_successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes < self.config.success_threshold {
                    tracing::debug!(
                        successes,
                        required = self.config.success_threshold,
                        "Circuit breaker: trial succeeded"
                    );
                    return;
                }
                if self.state.transition(CircuitState::HalfOpen, CircuitState::Closed) {
                    self.state.failure_count.store(0, Ordering::Release);
                    self.state.trial_successes.store(0, Ordering::Release);
                    self.state.opened_at_millis.store(0, Ordering::Release);
                    tracing::info!("Circuit breaker → closed");
                }
            }
            CircuitState::Closed => {
                self.state.failure_count.store(0, Ordering::Release);
            }
            // Late completions of calls admitted before the circuit opened carry no signal.
            _ => {}
        }
    }

    fn on_failure(&self, is_trial: bool) {
        match self.state.current() {
            CircuitState::HalfOpen if is_trial => {
                let failures = self.state.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
                // Timer first, so nobody observes Open with the stale timestamp.
                self.state.opened_at_millis.store(self.now_millis(), Ordering::Release);
                if self.state.transition(CircuitState::HalfOpen, CircuitState::Open) {
                    self.state.trial_successes.store(0, Ordering::Release);
                    tracing::warn!(failures, "Circuit breaker: trial failed → open");
                }
            }
            CircuitState::Closed => {
                let failures = self.state.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    self.state.opened_at_millis.store(self.now_millis(), Ordering::Release);
                    if self.state.transition(CircuitState::Closed, CircuitState::Open) {
                        tracing::error!(
                            failures,
                            threshold = self.config.failure_threshold,
                            "Circuit breaker → open"
                        );
                    }
                }
            }
            _ => {}
        }
    }

    fn open_error<E>(&self, elapsed: u64) -> ResilienceError<E> {
        ResilienceError::CircuitOpen {
            failure_count: self.failure_count(),
            open_for: Duration::from_millis(elapsed),
        }
    }

    fn open_elapsed(&self) -> u64 {
        let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
        self.now_millis().saturating_sub(opened_at)
    }

    fn reset_timeout_millis(&self) -> u64 {
        u64::try_from(self.config.reset_timeout.as_millis()).unwrap_or(u64::MAX)
    }

    fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }
}
