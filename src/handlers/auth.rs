// src/handlers/auth.rs

use super::base::{Action, ResponseHandler};
use crate::keys::checker::is_billing_failure;
use http::{HeaderMap, StatusCode};

/// 401/403 with a non-billing reason means the credential itself is bad:
/// revoked upstream, malformed, or scoped away from the endpoint. The key is
/// disabled permanently; billing-flavoured 403s are left for the chain's
/// billing handler.
pub struct AuthHandler;

impl ResponseHandler for AuthHandler {
    fn handle(&self, status: StatusCode, _headers: &HeaderMap, body: &[u8]) -> Option<Action> {
        match status {
            StatusCode::UNAUTHORIZED => Some(Action::DisableKeyAndRetry),
            StatusCode::FORBIDDEN => {
                let body_str = String::from_utf8_lossy(body);
                if is_billing_failure(&body_str) {
                    None
                } else {
                    Some(Action::DisableKeyAndRetry)
                }
            }
            _ => None,
        }
    }
}
