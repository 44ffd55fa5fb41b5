//! Per-request admission: identity, policy selection, limiter call, outcome.

use crate::config::{ConfigError, ValidatedConfig};
use crate::error::{AdmissionError, LimiterError};
use crate::identity::{self, Identity, TrustConfig, UserAgentMatcher};
use crate::rate_limit::{CounterStore, Policy, RateLimitRecord, SlidingWindowLimiter};
use crate::telemetry::{self, AdmissionEvent, BoxedSink, NullSink};
use http::HeaderMap;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// Immutable policy lookup: by name, by route prefix, or the default.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    policies: HashMap<Arc<str>, Policy>,
    /// Sorted longest prefix first.
    routes: Vec<(String, Arc<str>)>,
    default: Policy,
}

impl PolicyTable {
    pub fn new(policies: impl IntoIterator<Item = Policy>, default: &str) -> Result<Self, ConfigError> {
        let mut by_name = HashMap::new();
        for policy in policies {
            let name = policy.shared_name();
            if by_name.insert(name.clone(), policy).is_some() {
                return Err(ConfigError::DuplicatePolicy(name.to_string()));
            }
        }
        let Some(default) = by_name.get(default).cloned() else {
            return Err(ConfigError::UnknownPolicy(default.to_string()));
        };
        Ok(Self { policies: by_name, routes: Vec::new(), default })
    }

    /// Route requests whose path starts with `prefix` (on a segment boundary) to
    /// `policy`.
    pub fn with_route(mut self, prefix: &str, policy: &str) -> Result<Self, ConfigError> {
        let Some((name, _)) = self.policies.get_key_value(policy) else {
            return Err(ConfigError::UnknownPolicy(policy.to_string()));
        };
        let name = name.clone();
        self.routes.push((prefix.to_string(), name));
        self.routes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&Policy> {
        self.policies.get(name)
    }

    pub fn default_policy(&self) -> &Policy {
        &self.default
    }

    /// Policy for a request: an explicit known `tier` wins, then the longest
    /// matching route prefix, then the default.
    pub fn select(&self, path: &str, tier: Option<&str>) -> &Policy {
        if let Some(tier) = tier {
            match self.policies.get(tier) {
                Some(policy) => return policy,
                None => tracing::debug!(tier, "Unknown tier, falling back to route selection"),
            }
        }
        self.routes
            .iter()
            .find(|(prefix, _)| prefix_matches(prefix, path))
            .and_then(|(_, name)| self.policies.get(name))
            .unwrap_or_else(|| self.default_policy())
    }
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || prefix.ends_with('/') || rest.starts_with('/'),
        None => false,
    }
}

/// Rate-limit context of one admitted or rejected request.
///
/// Inserted into request extensions by the middleware and consumed by the header
/// emitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub policy: Arc<str>,
    pub limit: u64,
    pub window: Duration,
    pub record: RateLimitRecord,
}

impl RateLimitInfo {
    fn new(policy: &Policy, record: RateLimitRecord) -> Self {
        Self { policy: policy.shared_name(), limit: policy.limit(), window: policy.window(), record }
    }

    pub fn remaining(&self) -> u64 {
        self.record.remaining(self.limit)
    }
}

/// Why a request was turned away. Both variants map to 429.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The caller exceeded the policy.
    Policy(RateLimitInfo),
    /// The store circuit is open and fail-open is disabled.
    CircuitOpen { policy: Arc<str>, limit: u64, window: Duration, retry_after: Duration },
}

impl Rejection {
    pub fn retry_after(&self) -> Duration {
        match self {
            Rejection::Policy(info) => info.record.retry_after(),
            Rejection::CircuitOpen { retry_after, .. } => *retry_after,
        }
    }

    pub fn policy(&self) -> &str {
        match self {
            Rejection::Policy(info) => &info.policy,
            Rejection::CircuitOpen { policy, .. } => policy,
        }
    }

    pub fn status(&self) -> http::StatusCode {
        http::StatusCode::TOO_MANY_REQUESTS
    }
}

/// Outcome of [`AdmissionGuard::admit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allowed(RateLimitInfo),
    Rejected(Rejection),
    /// The user agent is on the bypass list; nothing was counted.
    Bypassed,
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Admission::Rejected(_))
    }
}

/// The parts of a request the guard looks at.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionRequest<'a> {
    /// Address of the directly connected peer.
    pub peer: IpAddr,
    pub headers: &'a HeaderMap,
    pub path: &'a str,
    /// Explicit policy name, e.g. from an authenticated service tier.
    pub tier: Option<&'a str>,
}

impl<'a> AdmissionRequest<'a> {
    pub fn new(peer: IpAddr, headers: &'a HeaderMap, path: &'a str) -> Self {
        Self { peer, headers, path, tier: None }
    }

    pub fn with_tier(mut self, tier: Option<&'a str>) -> Self {
        self.tier = tier;
        self
    }
}

/// Runs once per request: resolve identity, select policy, check the limiter.
pub struct AdmissionGuard<S> {
    limiter: Arc<SlidingWindowLimiter<S>>,
    policies: Arc<PolicyTable>,
    trust: Arc<TrustConfig>,
    bypass: Arc<UserAgentMatcher>,
    bypass_trusted_only: bool,
    sink: BoxedSink,
}

impl<S> Clone for AdmissionGuard<S> {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            policies: self.policies.clone(),
            trust: self.trust.clone(),
            bypass: self.bypass.clone(),
            bypass_trusted_only: self.bypass_trusted_only,
            sink: self.sink.clone(),
        }
    }
}

impl<S> std::fmt::Debug for AdmissionGuard<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionGuard")
            .field("limiter", &self.limiter)
            .field("policies", &self.policies)
            .field("trust", &self.trust)
            .finish()
    }
}

impl<S: CounterStore> AdmissionGuard<S> {
    pub fn new(limiter: SlidingWindowLimiter<S>, policies: PolicyTable, trust: TrustConfig) -> Self {
        Self {
            limiter: Arc::new(limiter),
            policies: Arc::new(policies),
            trust: Arc::new(trust),
            bypass: Arc::new(UserAgentMatcher::default()),
            bypass_trusted_only: false,
            sink: telemetry::boxed(NullSink),
        }
    }

    /// Build the limiter and guard from checked configuration, sharing `sink`.
    pub fn from_config(store: S, config: &ValidatedConfig, sink: BoxedSink) -> Self {
        let limiter = SlidingWindowLimiter::builder(store)
            .key_prefix(config.key_prefix.as_str())
            .circuit_breaker(config.breaker.clone())
            .max_concurrency(config.max_concurrency)
            .command_timeout(config.command_timeout.duration())
            .fallback(config.fallback)
            .telemetry(sink.clone())
            .build();
        Self::new(limiter, config.policies.clone(), config.trust.clone())
            .with_bypass(config.bypass.clone())
            .with_bypass_trusted_only(config.bypass_trusted_only)
            .with_telemetry(sink)
    }

    /// Skip rate limiting for matching `User-Agent` values.
    ///
    /// The header is chosen by the client, so any caller can claim a listed agent.
    /// Pair this with [`with_bypass_trusted_only`](Self::with_bypass_trusted_only)
    /// unless unlimited access for anyone who asks is acceptable.
    pub fn with_bypass(mut self, bypass: UserAgentMatcher) -> Self {
        self.bypass = Arc::new(bypass);
        self
    }

    /// Honor the user-agent bypass only when the connected peer is a trusted proxy
    /// address. Other peers claiming a listed agent are counted like anyone else.
    pub fn with_bypass_trusted_only(mut self, trusted_only: bool) -> Self {
        self.bypass_trusted_only = trusted_only;
        self
    }

    pub fn with_telemetry(mut self, sink: BoxedSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn limiter(&self) -> &SlidingWindowLimiter<S> {
        &self.limiter
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    /// Identity the guard would count `request` against.
    pub fn identify(&self, request: &AdmissionRequest<'_>) -> Identity {
        identity::resolve(request.peer, request.headers, &self.trust)
    }

    /// Decide whether `request` may proceed.
    ///
    /// Rejections are `Ok(Admission::Rejected(_))`. `Err` only occurs when the store
    /// fails and fail-open is disabled.
    pub async fn admit(&self, request: &AdmissionRequest<'_>) -> Result<Admission, AdmissionError> {
        let policy = self.policies.select(request.path, request.tier);

        if self.bypass.matches_headers(request.headers) && self.bypass_allowed(request) {
            tracing::trace!(policy = policy.name(), "Rate limit bypassed by user agent");
            self.emit(AdmissionEvent::Bypassed { policy: policy.shared_name() }).await;
            return Ok(Admission::Bypassed);
        }

        let identity = self.identify(request);
        match self.limiter.check_or_degrade(identity.as_str(), policy).await {
            Ok((record, _)) if record.is_blocked => {
                let info = RateLimitInfo::new(policy, record);
                tracing::debug!(
                    policy = policy.name(),
                    identity = %identity,
                    total_hits = record.total_hits,
                    "Rate limit exceeded"
                );
                self.emit(AdmissionEvent::Rejected {
                    policy: policy.shared_name(),
                    total_hits: record.total_hits,
                    retry_after: record.retry_after(),
                })
                .await;
                Ok(Admission::Rejected(Rejection::Policy(info)))
            }
            Ok((record, degraded)) => {
                // A degraded check already reported FailOpen.
                if !degraded {
                    self.emit(AdmissionEvent::Admitted {
                        policy: policy.shared_name(),
                        total_hits: record.total_hits,
                        limit: policy.limit(),
                    })
                    .await;
                }
                Ok(Admission::Allowed(RateLimitInfo::new(policy, record)))
            }
            Err(LimiterError::CircuitOpen { open_for, .. }) => {
                let retry_after = self.limiter.circuit_retry_after(open_for);
                self.emit(AdmissionEvent::CircuitRejected { policy: policy.shared_name(), retry_after })
                    .await;
                Ok(Admission::Rejected(Rejection::CircuitOpen {
                    policy: policy.shared_name(),
                    limit: policy.limit(),
                    window: policy.window(),
                    retry_after,
                }))
            }
            Err(LimiterError::BackendUnavailable(source)) => {
                Err(AdmissionError::BackendUnavailable { policy: policy.name().to_string(), source })
            }
        }
    }

    fn bypass_allowed(&self, request: &AdmissionRequest<'_>) -> bool {
        if !self.bypass_trusted_only || self.trust.is_trusted(&request.peer) {
            return true;
        }
        tracing::debug!(peer = %request.peer, "Bypass user agent from untrusted peer, counting it");
        false
    }

    async fn emit(&self, event: AdmissionEvent) {
        telemetry::emit_best_effort(&self.sink, event).await;
    }
}
