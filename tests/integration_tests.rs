// tests/integration_tests.rs
//
// End-to-end pipeline scenarios against mock upstreams.

mod common;

use axum::http::{Method, StatusCode};
use common::*;
use llm_key_proxy::keys::provider::KeyProvider;
use llm_key_proxy::keys::record::Service;
use serde_json::json;
use std::time::{Duration, Instant};
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn basic_openai_chat_uses_first_key_and_charges_it() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer test-key-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-up",
            "object": "chat.completion",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "hello"},
                "finish_reason": "stop",
            }],
            "usage": {"prompt_tokens": 2, "completion_tokens": 1, "total_tokens": 3},
        })))
        .expect(1)
        .mount(&server)
        .await;

    let config = with_openai(base_config(), &["test-key-1", "test-key-2"], &server.uri());
    let (state, router) = test_app(&config).await;

    let (status, body) = post_json(
        &router,
        "/v1/chat/completions",
        &json!({"model": "gpt-4", "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    // Identity pair: upstream body arrives verbatim.
    assert_eq!(body["id"], "chatcmpl-up");
    assert_eq!(body["choices"][0]["message"]["content"], "hello");

    let provider = state.pool.provider(Service::OpenAi).unwrap();
    let views = provider.list();
    let used = views.iter().find(|v| v.prompt_count == 1).unwrap();
    assert!(used.last_used_ms_ago.is_some(), "last_used must advance");
    assert_eq!(used.total_tokens, 1, "usage follows the upstream count");
}

#[tokio::test]
async fn lockout_failover_dispatches_with_the_other_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer key-two"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "ok"}, "finish_reason": "stop"}],
        })))
        .expect(1)
        .mount(&server)
        .await;

    let config = with_openai(base_config(), &["key-one", "key-two"], &server.uri());
    let (state, router) = test_app(&config).await;

    // Arm a lockout on key-one; selection must prefer key-two.
    let provider = state.pool.provider(Service::OpenAi).unwrap();
    let key_one_hash = provider.list()[0].hash.clone();
    provider.mark_rate_limited(&key_one_hash);

    let (status, _body) = post_json(
        &router,
        "/v1/chat/completions",
        &json!({"model": "gpt-4", "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn openai_client_reaches_claude_via_text_dialect() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/complete"))
        .and(header("x-api-key", "sk-ant-key"))
        .and(header("anthropic-version", "2023-06-01"))
        .and(body_string_contains("Human:"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "completion": " Bonjour!",
            "stop_reason": "stop_sequence",
            "model": "claude-2",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let config = with_anthropic(base_config(), &["sk-ant-key"], &server.uri());
    let (_state, router) = test_app(&config).await;

    let (status, body) = post_json(
        &router,
        "/v1/chat/completions",
        &json!({"model": "claude-2", "messages": [{"role": "user", "content": "salut"}]}),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    // The completion field is reshaped into choices[0].message.
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "Bonjour!");
    assert!(body["usage"]["completion_tokens"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn claude3_text_completion_is_upgraded_to_messages() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "sk-ant-key"))
        .and(body_string_contains("\"messages\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_1",
            "model": "claude-3-opus-20240229",
            "content": [{"type": "text", "text": "hi there"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 3, "output_tokens": 2},
        })))
        .expect(1)
        .mount(&server)
        .await;

    let config = with_anthropic(base_config(), &["sk-ant-key"], &server.uri());
    let (_state, router) = test_app(&config).await;

    let (status, body) = post_json(
        &router,
        "/v1/complete",
        &json!({
            "model": "claude-3-opus-20240229",
            "prompt": "\n\nHuman: hi\n\nAssistant:",
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    // Response is reshaped back into the text-completion dialect.
    assert_eq!(body["type"], "completion");
    assert_eq!(body["completion"], "hi there");
}

#[tokio::test]
async fn billing_403_revokes_the_key_and_retries_transparently() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "dead-key"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "error": {"type": "forbidden", "message": "Your credit balance is too low"},
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "live-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_ok",
            "model": "claude-3-sonnet-20240229",
            "content": [{"type": "text", "text": "fine"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 1, "output_tokens": 1},
        })))
        .expect(1)
        .mount(&server)
        .await;

    let config = with_anthropic(base_config(), &["dead-key", "live-key"], &server.uri());
    let (state, router) = test_app(&config).await;

    let (status, body) = post_json(
        &router,
        "/v1/messages",
        &json!({
            "model": "claude-3-sonnet-20240229",
            "max_tokens": 16,
            "messages": [{"role": "user", "content": "hi"}],
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], "msg_ok");

    let provider = state.pool.provider(Service::Anthropic).unwrap();
    let views = provider.list();
    let dead = views.iter().find(|v| v.prompt_count == 0).unwrap();
    assert!(dead.is_revoked, "billing failure must revoke");
    assert!(dead.is_disabled, "revoked implies disabled");
    assert_eq!(provider.available(), 1);
}

#[tokio::test]
async fn rate_limited_key_backs_off_then_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": {"type": "rate_limit_error", "message": "slow down"},
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "ok"}, "finish_reason": "stop"}],
        })))
        .mount(&server)
        .await;

    let mut config = with_openai(base_config(), &["only-key"], &server.uri());
    config.services.openai.rate_limit_lockout_ms = 200;
    config.services.openai.key_reuse_delay_ms = 50;
    let (state, router) = test_app(&config).await;

    let started = Instant::now();
    let (status, _body) = post_json(
        &router,
        "/v1/chat/completions",
        &json!({"model": "gpt-4", "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(
        started.elapsed() >= Duration::from_millis(150),
        "retry must wait out the lockout"
    );

    // The 429 left its mark on the pool.
    let provider = state.pool.provider(Service::OpenAi).unwrap();
    assert_eq!(provider.list()[0].prompt_count, 1);
}

#[tokio::test]
async fn unconfigured_service_yields_payment_required() {
    let server = MockServer::start().await;
    let config = with_openai(base_config(), &["k"], &server.uri());
    let (_state, router) = test_app(&config).await;

    let (status, body) = post_json(
        &router,
        "/v1/chat/completions",
        &json!({"model": "gemini-pro", "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["title"], "No Keys Available");
}

#[tokio::test]
async fn invalid_body_is_rejected_before_the_queue() {
    let server = MockServer::start().await;
    let config = with_openai(base_config(), &["k"], &server.uri());
    let (_state, router) = test_app(&config).await;

    let (status, _) = post_json(
        &router,
        "/v1/chat/completions",
        &json!({"model": "gpt-4", "messages": []}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post_json(&router, "/v1/chat/completions", &json!({"model": "gpt-4"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn streaming_claude_is_reshaped_into_openai_chunks() {
    let sse_body = concat!(
        "data: {\"type\":\"completion\",\"completion\":\"Hel\",\"stop_reason\":null}\n\n",
        "data: {\"type\":\"completion\",\"completion\":\"lo\",\"stop_reason\":\"stop_sequence\"}\n\n",
    );
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/complete"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse_body.as_bytes().to_vec(), "text/event-stream"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let config = with_anthropic(base_config(), &["sk-ant-key"], &server.uri());
    let (_state, router) = test_app(&config).await;

    let response = send_json(
        &router,
        Method::POST,
        "/v1/chat/completions",
        &json!({
            "model": "claude-2",
            "stream": true,
            "messages": [{"role": "user", "content": "hi"}],
        }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );
    let body = String::from_utf8(read_body(response).await).unwrap();
    assert!(body.contains("chat.completion.chunk"));
    assert!(body.contains("Hel"));
    assert!(body.contains("lo"));
    // The terminating marker is synthesised for OpenAI-dialect clients.
    assert!(body.trim_end().ends_with("data: [DONE]"));
}

#[tokio::test]
async fn models_listing_is_synthesised_and_cached() {
    let server = MockServer::start().await;
    let config = with_anthropic(
        with_openai(base_config(), &["k-openai"], &server.uri()),
        &["k-anthropic"],
        &server.uri(),
    );
    let (_state, router) = test_app(&config).await;

    let response = send_json(&router, Method::GET, "/v1/models", &json!({})).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value =
        serde_json::from_slice(&read_body(response).await).unwrap();
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|m| m["id"].as_str())
        .collect();
    assert!(ids.contains(&"gpt-4"));
    assert!(ids.contains(&"claude-2"));
    // Claimed families only: no google keys, no gemini models.
    assert!(!ids.iter().any(|id| id.starts_with("gemini")));
}

#[tokio::test]
async fn admin_listing_redacts_secrets() {
    let server = MockServer::start().await;
    let config = with_openai(base_config(), &["sk-super-secret-key"], &server.uri());
    let (_state, router) = test_app(&config).await;

    let response = send_json(&router, Method::GET, "/admin/keys", &json!({})).await;
    assert_eq!(response.status(), StatusCode::OK);
    let raw = String::from_utf8(read_body(response).await).unwrap();
    assert!(!raw.contains("sk-super-secret-key"));
    assert!(raw.contains("oai-"));
}

#[tokio::test]
async fn auth_failure_disables_key_and_propagates_when_pool_is_empty() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": {"message": "Incorrect API key provided"},
        })))
        .mount(&server)
        .await;

    let config = with_openai(base_config(), &["bad-key"], &server.uri());
    let (state, router) = test_app(&config).await;

    let (status, _) = post_json(
        &router,
        "/v1/chat/completions",
        &json!({"model": "gpt-4", "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;
    // Sole key disabled: the upstream response is propagated.
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let provider = state.pool.provider(Service::OpenAi).unwrap();
    assert_eq!(provider.available(), 0);
}
