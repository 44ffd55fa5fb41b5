//! Admission configuration.
//!
//! [`AdmissionConfig`] is the raw, serializable surface (all durations in
//! milliseconds). [`AdmissionConfig::validate`] turns it into a [`ValidatedConfig`]
//! whose parts are immutable and ready to hand to the limiter and the guard.
//! Invalid configuration is a startup error and is never patched up silently.
//!
//! ```rust
//! # #[cfg(feature = "serde")]
//! # fn main() -> Result<(), tollgate::config::ConfigError> {
//! use tollgate::config::AdmissionConfig;
//!
//! let config = AdmissionConfig::from_json(
//!     r#"{
//!         "fail_open": false,
//!         "trust": { "trusted_proxies": ["10.0.0.0/8"] },
//!         "routes": [{ "prefix": "/login", "policy": "auth" }]
//!     }"#,
//! )?;
//! let validated = config.validate()?;
//! assert_eq!(validated.policies.select("/login", None).name(), "auth");
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "serde"))]
//! # fn main() {}
//! ```

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerError};
use crate::guard::PolicyTable;
use crate::identity::{TrustConfig, UserAgentMatcher};
use crate::rate_limit::{FallbackMode, Policy, DEFAULT_KEY_PREFIX};
use crate::timeout::TimeoutPolicy;
use std::time::Duration;
use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Invalid policy, trust or resilience configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid policy name '{0}': must be non-empty and must not contain ':'")]
    InvalidPolicyName(String),
    #[error("policy '{0}' has a zero window")]
    ZeroWindow(String),
    #[error("policy '{0}' is defined more than once")]
    DuplicatePolicy(String),
    #[error("unknown policy '{0}'")]
    UnknownPolicy(String),
    #[error("invalid trusted proxy '{0}': expected an IP address or CIDR block")]
    InvalidTrustedProxy(String),
    #[error("invalid circuit breaker configuration: {0}")]
    CircuitBreaker(#[from] CircuitBreakerError),
    #[error("bulkhead max_concurrency must be > 0")]
    ZeroConcurrency,
    #[error("{0} timeout must be > 0")]
    ZeroTimeout(&'static str),
    #[error("malformed configuration: {0}")]
    Malformed(String),
}

/// Raw configuration, as loaded from a file or built in code.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct AdmissionConfig {
    pub store: StoreSettings,
    /// Admit requests when the store is unavailable.
    pub fail_open: bool,
    pub circuit_breaker: BreakerSettings,
    pub bulkhead: BulkheadSettings,
    pub trust: TrustSettings,
    pub policies: Vec<PolicySettings>,
    pub routes: Vec<RouteSettings>,
    pub default_policy: String,
    /// User-agent substrings that skip rate limiting (health checkers). Clients set
    /// this header themselves; see `bypass_trusted_only`.
    pub bypass_user_agents: Vec<String>,
    /// Honor `bypass_user_agents` only for peers in `trust.trusted_proxies`.
    pub bypass_trusted_only: bool,
}

impl Default for AdmissionConfig {
    /// Three tiers: `standard` (100/min), `auth` (5 per 15 min, 15 min penalty) and
    /// `admin` (30/min), with `standard` as the default.
    fn default() -> Self {
        Self {
            store: StoreSettings::default(),
            fail_open: true,
            circuit_breaker: BreakerSettings::default(),
            bulkhead: BulkheadSettings::default(),
            trust: TrustSettings::default(),
            policies: vec![
                PolicySettings::new("standard", 60_000, 100),
                PolicySettings { block_duration_ms: Some(900_000), ..PolicySettings::new("auth", 900_000, 5) },
                PolicySettings::new("admin", 60_000, 30),
            ],
            routes: Vec::new(),
            default_policy: "standard".into(),
            bypass_user_agents: Vec::new(),
            bypass_trusted_only: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct StoreSettings {
    pub url: String,
    pub key_prefix: String,
    pub connect_timeout_ms: u64,
    pub command_timeout_ms: u64,
    /// Connect over TLS (`rediss://`).
    pub tls: bool,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".into(),
            key_prefix: DEFAULT_KEY_PREFIX.into(),
            connect_timeout_ms: 2_000,
            command_timeout_ms: 250,
            tls: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BreakerSettings {
    pub failure_threshold: usize,
    pub reset_timeout_ms: u64,
    pub success_threshold: usize,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self { failure_threshold: 5, reset_timeout_ms: 30_000, success_threshold: 1 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BulkheadSettings {
    pub max_concurrency: usize,
}

impl Default for BulkheadSettings {
    fn default() -> Self {
        Self { max_concurrency: 64 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TrustSettings {
    /// IP addresses or CIDR blocks.
    pub trusted_proxies: Vec<String>,
    pub max_proxy_hops: usize,
    pub trust_x_real_ip: bool,
}

impl Default for TrustSettings {
    fn default() -> Self {
        Self { trusted_proxies: Vec::new(), max_proxy_hops: 1, trust_x_real_ip: false }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PolicySettings {
    pub name: String,
    pub window_ms: u64,
    pub limit: u64,
    #[cfg_attr(feature = "serde", serde(default))]
    pub block_duration_ms: Option<u64>,
}

impl PolicySettings {
    pub fn new(name: impl Into<String>, window_ms: u64, limit: u64) -> Self {
        Self { name: name.into(), window_ms, limit, block_duration_ms: None }
    }

    fn to_policy(&self) -> Result<Policy, ConfigError> {
        let policy = Policy::new(self.name.as_str(), Duration::from_millis(self.window_ms), self.limit)?;
        Ok(match self.block_duration_ms {
            Some(ms) => policy.with_block_duration(Duration::from_millis(ms)),
            None => policy,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RouteSettings {
    pub prefix: String,
    pub policy: String,
}

/// Checked configuration, ready for construction of the limiter and guard.
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub policies: PolicyTable,
    pub trust: TrustConfig,
    pub bypass: UserAgentMatcher,
    pub bypass_trusted_only: bool,
    pub breaker: CircuitBreakerConfig,
    pub max_concurrency: usize,
    pub command_timeout: TimeoutPolicy,
    pub connect_timeout: Duration,
    pub key_prefix: String,
    pub fallback: FallbackMode,
    pub store_url: String,
    pub tls: bool,
}

impl AdmissionConfig {
    /// Parse a JSON document. Missing sections take their defaults.
    #[cfg(feature = "serde")]
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Malformed(e.to_string()))
    }

    pub fn validate(&self) -> Result<ValidatedConfig, ConfigError> {
        let policies = self.policies.iter().map(PolicySettings::to_policy).collect::<Result<Vec<_>, _>>()?;
        let mut table = PolicyTable::new(policies, &self.default_policy)?;
        for route in &self.routes {
            table = table.with_route(&route.prefix, &route.policy)?;
        }

        let trust = TrustConfig::parse(&self.trust.trusted_proxies, self.trust.max_proxy_hops)?
            .with_x_real_ip(self.trust.trust_x_real_ip);

        let breaker = CircuitBreakerConfig::new(
            self.circuit_breaker.failure_threshold,
            Duration::from_millis(self.circuit_breaker.reset_timeout_ms),
            self.circuit_breaker.success_threshold,
        )?;

        if self.bulkhead.max_concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        let command_timeout = TimeoutPolicy::new(Duration::from_millis(self.store.command_timeout_ms))
            .ok_or(ConfigError::ZeroTimeout("command"))?;
        if self.store.connect_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout("connect"));
        }

        let bypass = UserAgentMatcher::new(&self.bypass_user_agents);
        if !bypass.is_empty() && !self.bypass_trusted_only {
            tracing::warn!("User-agent bypass applies to any peer; clients can claim a listed agent");
        }

        if !self.fail_open {
            tracing::info!("Rate limiter configured fail-closed: store outages will reject requests");
        }

        Ok(ValidatedConfig {
            policies: table,
            trust,
            bypass,
            bypass_trusted_only: self.bypass_trusted_only,
            breaker,
            max_concurrency: self.bulkhead.max_concurrency,
            command_timeout,
            connect_timeout: Duration::from_millis(self.store.connect_timeout_ms),
            key_prefix: self.store.key_prefix.clone(),
            fallback: FallbackMode::from_fail_open(self.fail_open),
            store_url: self.store.url.clone(),
            tls: self.store.tls,
        })
    }
}
