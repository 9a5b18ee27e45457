// tests/common/mod.rs

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    response::Response,
    Router,
};
use llm_key_proxy::{config::AppConfig, create_router, state::AppState};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

/// Config with key checking disabled so keys claim default families
/// immediately instead of waiting for probes.
pub fn base_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.check_keys = false;
    config
}

pub fn with_openai(mut config: AppConfig, keys: &[&str], base_url: &str) -> AppConfig {
    config.services.openai.keys = keys.iter().map(|k| k.to_string()).collect();
    config.services.openai.base_url = Some(base_url.to_string());
    config
}

pub fn with_anthropic(mut config: AppConfig, keys: &[&str], base_url: &str) -> AppConfig {
    config.services.anthropic.keys = keys.iter().map(|k| k.to_string()).collect();
    config.services.anthropic.base_url = Some(base_url.to_string());
    config
}

/// Build the shared state and router for a test.
pub async fn test_app(config: &AppConfig) -> (Arc<AppState>, Router) {
    let state = Arc::new(
        AppState::new(config)
            .await
            .expect("AppState::new failed in test setup"),
    );
    let router = create_router(Arc::clone(&state));
    (state, router)
}

pub async fn send_json(router: &Router, method: Method, path: &str, body: &Value) -> Response {
    let request = Request::builder()
        .method(method)
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap();
    router
        .clone()
        .oneshot(request)
        .await
        .expect("router returned an infallible error")
}

pub async fn post_json(router: &Router, path: &str, body: &Value) -> (StatusCode, Value) {
    let response = send_json(router, Method::POST, path, body).await;
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("failed to read response body");
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

pub async fn read_body(response: Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("failed to read response body")
        .to_vec()
}
