// src/handlers/base.rs

use http::{HeaderMap, StatusCode};

/// Defines the next action taken by the dispatch loop after examining an
/// upstream response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// 2xx: charge accounting, post-process, return to the client.
    Success,
    /// Credential permanently rejected: disable the key, retry with another.
    DisableKeyAndRetry,
    /// Terminal billing failure: revoke the key, retry with another.
    RevokeKeyAndRetry,
    /// 429 from true rate exceedance: arm the lockout, bounded retry.
    RateLimitedRetry,
    /// 429 from a concurrency ceiling: retry without arming the full
    /// lockout (the reuse throttle armed at selection is enough).
    ConcurrencyLimitedRetry,
    /// 5xx: retry once with a fresh key, then propagate.
    RetryOnceFresh,
    /// Return the upstream response as-is.
    Passthrough,
}

/// A link in the response-analysis chain. Each implementation recognises one
/// class of upstream outcome; the first `Some` wins.
pub trait ResponseHandler: Send + Sync {
    fn handle(&self, status: StatusCode, headers: &HeaderMap, body: &[u8]) -> Option<Action>;
}
