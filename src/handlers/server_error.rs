// src/handlers/server_error.rs

use super::base::{Action, ResponseHandler};
use http::{HeaderMap, StatusCode};

/// 5xx responses get one retry with a fresh key; the dispatch loop
/// propagates the response once the retry budget is spent.
pub struct ServerErrorHandler;

impl ResponseHandler for ServerErrorHandler {
    fn handle(&self, status: StatusCode, _headers: &HeaderMap, _body: &[u8]) -> Option<Action> {
        if status.is_server_error() {
            Some(Action::RetryOnceFresh)
        } else {
            None
        }
    }
}
