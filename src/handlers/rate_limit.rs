// src/handlers/rate_limit.rs

use super::base::{Action, ResponseHandler};
use http::{HeaderMap, StatusCode};

/// Transient 429s. True rate exceedance arms the key's lockout; 429s caused
/// by per-account concurrency ceilings only ride the reuse throttle, so a
/// busy key is not mistaken for an exhausted one.
pub struct RateLimitHandler;

fn is_concurrency_limit(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("concurrent") || lower.contains("overloaded")
}

impl ResponseHandler for RateLimitHandler {
    fn handle(&self, status: StatusCode, _headers: &HeaderMap, body: &[u8]) -> Option<Action> {
        if status != StatusCode::TOO_MANY_REQUESTS {
            return None;
        }
        let body_str = String::from_utf8_lossy(body);
        if is_concurrency_limit(&body_str) {
            Some(Action::ConcurrencyLimitedRetry)
        } else {
            Some(Action::RateLimitedRetry)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_429_arms_the_lockout() {
        let action = RateLimitHandler.handle(
            StatusCode::TOO_MANY_REQUESTS,
            &HeaderMap::new(),
            br#"{"error":{"type":"rate_limit_error"}}"#,
        );
        assert_eq!(action, Some(Action::RateLimitedRetry));
    }

    #[test]
    fn concurrency_429_skips_the_lockout() {
        let action = RateLimitHandler.handle(
            StatusCode::TOO_MANY_REQUESTS,
            &HeaderMap::new(),
            br#"{"error":{"message":"Number of concurrent connections exceeded"}}"#,
        );
        assert_eq!(action, Some(Action::ConcurrencyLimitedRetry));
    }

    #[test]
    fn other_statuses_are_ignored() {
        let action = RateLimitHandler.handle(StatusCode::OK, &HeaderMap::new(), b"");
        assert_eq!(action, None);
    }
}
