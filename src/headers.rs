//! Standard rate-limit response headers.
//!
//! Derived purely from the request's [`RateLimitInfo`] (or [`Rejection`]), so header
//! formatting is independent of the limiting algorithm.
//!
//! | header | value |
//! |---|---|
//! | `RateLimit-Limit` | configured limit |
//! | `RateLimit-Remaining` | `max(0, limit - hits)` |
//! | `RateLimit-Reset` | seconds until reset, rounded up |
//! | `RateLimit-Policy` | `{limit};w={window seconds}` |
//! | `Retry-After` | seconds; only when remaining is 0 or the request was rejected |

use crate::guard::{RateLimitInfo, Rejection};
use http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use std::time::Duration;

pub const RATELIMIT_LIMIT: &str = "ratelimit-limit";
pub const RATELIMIT_REMAINING: &str = "ratelimit-remaining";
pub const RATELIMIT_RESET: &str = "ratelimit-reset";
pub const RATELIMIT_POLICY: &str = "ratelimit-policy";

/// Headers for an admitted (or policy-rejected) request.
pub fn rate_limit_headers(info: &RateLimitInfo, rejected: bool) -> HeaderMap {
    let remaining = info.remaining();
    let reset = info.record.reset_secs();
    let retry_after = (rejected || remaining == 0).then(|| secs_ceil(info.record.retry_after()).max(reset));
    build(info.limit, remaining, reset, info.window, retry_after)
}

/// Headers for a rejected request.
pub fn rejection_headers(rejection: &Rejection) -> HeaderMap {
    match rejection {
        Rejection::Policy(info) => rate_limit_headers(info, true),
        Rejection::CircuitOpen { limit, window, retry_after, .. } => {
            let secs = secs_ceil(*retry_after);
            build(*limit, 0, secs, *window, Some(secs))
        }
    }
}

/// Copy `source` into `target`, replacing same-named headers.
pub fn apply(target: &mut HeaderMap, source: &HeaderMap) {
    for (name, value) in source {
        target.insert(name.clone(), value.clone());
    }
}

fn build(limit: u64, remaining: u64, reset: u64, window: Duration, retry_after: Option<u64>) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(5);
    headers.insert(HeaderName::from_static(RATELIMIT_LIMIT), HeaderValue::from(limit));
    headers.insert(HeaderName::from_static(RATELIMIT_REMAINING), HeaderValue::from(remaining));
    headers.insert(HeaderName::from_static(RATELIMIT_RESET), HeaderValue::from(reset));
    if let Ok(policy) = HeaderValue::try_from(format!("{limit};w={}", secs_ceil(window))) {
        headers.insert(HeaderName::from_static(RATELIMIT_POLICY), policy);
    }
    if let Some(secs) = retry_after {
        headers.insert(RETRY_AFTER, HeaderValue::from(secs));
    }
    headers
}

fn secs_ceil(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).div_ceil(1000)
}
