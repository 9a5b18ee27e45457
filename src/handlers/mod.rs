// src/handlers/mod.rs
//
// Response-analysis chain: each handler recognises one class of upstream
// outcome and maps it to the pool signal the dispatch loop should apply.

pub mod auth;
pub mod base;
pub mod billing;
pub mod rate_limit;
pub mod server_error;
pub mod success;

pub use base::{Action, ResponseHandler};

use http::{HeaderMap, StatusCode};

/// The standard chain, in priority order. Billing runs before the generic
/// rate-limit and auth checks so terminal quota failures are not mistaken
/// for transient ones.
pub fn default_handlers() -> Vec<Box<dyn ResponseHandler>> {
    vec![
        Box::new(success::SuccessHandler),
        Box::new(billing::BillingHandler),
        Box::new(auth::AuthHandler),
        Box::new(rate_limit::RateLimitHandler),
        Box::new(server_error::ServerErrorHandler),
    ]
}

/// Run the chain; unmatched responses pass through untouched.
pub fn analyze(
    handlers: &[Box<dyn ResponseHandler>],
    status: StatusCode,
    headers: &HeaderMap,
    body: &[u8],
) -> Action {
    handlers
        .iter()
        .find_map(|h| h.handle(status, headers, body))
        .unwrap_or(Action::Passthrough)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_priority_billing_over_rate_limit() {
        let handlers = default_handlers();
        let body = br#"{"error":{"type":"insufficient_quota"}}"#;
        assert_eq!(
            analyze(&handlers, StatusCode::TOO_MANY_REQUESTS, &HeaderMap::new(), body),
            Action::RevokeKeyAndRetry
        );
        assert_eq!(
            analyze(&handlers, StatusCode::TOO_MANY_REQUESTS, &HeaderMap::new(), b"{}"),
            Action::RateLimitedRetry
        );
    }

    #[test]
    fn unmatched_status_passes_through() {
        let handlers = default_handlers();
        assert_eq!(
            analyze(&handlers, StatusCode::NOT_FOUND, &HeaderMap::new(), b"{}"),
            Action::Passthrough
        );
    }

    #[test]
    fn success_wins_first() {
        let handlers = default_handlers();
        assert_eq!(
            analyze(&handlers, StatusCode::OK, &HeaderMap::new(), b"{}"),
            Action::Success
        );
    }
}
