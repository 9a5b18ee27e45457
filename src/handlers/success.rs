// src/handlers/success.rs

use super::base::{Action, ResponseHandler};
use http::{HeaderMap, StatusCode};

pub struct SuccessHandler;

impl ResponseHandler for SuccessHandler {
    fn handle(&self, status: StatusCode, _headers: &HeaderMap, _body: &[u8]) -> Option<Action> {
        if status.is_success() {
            Some(Action::Success)
        } else {
            None
        }
    }
}
