// src/handlers/billing.rs

use super::base::{Action, ResponseHandler};
use crate::keys::checker::is_billing_failure;
use http::{HeaderMap, StatusCode};

/// Terminal billing failures: an OpenAI 429 carrying `insufficient_quota`,
/// or an Anthropic 403 with billing phrasing. The credential will not
/// recover on its own, so it is revoked rather than locked out.
pub struct BillingHandler;

impl ResponseHandler for BillingHandler {
    fn handle(&self, status: StatusCode, _headers: &HeaderMap, body: &[u8]) -> Option<Action> {
        if status != StatusCode::TOO_MANY_REQUESTS && status != StatusCode::FORBIDDEN {
            return None;
        }
        let body_str = String::from_utf8_lossy(body);
        if body_str.contains("insufficient_quota") || is_billing_failure(&body_str) {
            Some(Action::RevokeKeyAndRetry)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_quota_revokes() {
        let body = br#"{"error":{"type":"insufficient_quota","message":"You exceeded your current quota"}}"#;
        let action = BillingHandler.handle(StatusCode::TOO_MANY_REQUESTS, &HeaderMap::new(), body);
        assert_eq!(action, Some(Action::RevokeKeyAndRetry));
    }

    #[test]
    fn anthropic_billing_forbidden_revokes() {
        let body = br#"{"error":{"type":"forbidden","message":"Billing issue: credit balance too low"}}"#;
        let action = BillingHandler.handle(StatusCode::FORBIDDEN, &HeaderMap::new(), body);
        assert_eq!(action, Some(Action::RevokeKeyAndRetry));
    }

    #[test]
    fn plain_rate_limit_is_not_billing() {
        let body = br#"{"error":{"type":"rate_limit_error","message":"slow down"}}"#;
        let action = BillingHandler.handle(StatusCode::TOO_MANY_REQUESTS, &HeaderMap::new(), body);
        assert_eq!(action, None);
    }
}
