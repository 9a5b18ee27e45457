// src/upstream.rs
//
// Post-dequeue half of the pipeline: stamp authorization from the bound key,
// dispatch with the service's deadline, feed upstream outcomes back into the
// pool through the response-analysis chain, and post-process the body or
// stream before it reaches the client.

use crate::context::RequestContext;
use crate::dialect::streaming::{
    encode_done, encode_event, output_text, stream_transform, SseCodec, DONE_MARKER,
};
use crate::dialect::{ApiDialect, TRANSFORMS};
use crate::error::{AppError, Result};
use crate::handlers::{analyze, Action};
use crate::keys::checker::ANTHROPIC_VERSION;
use crate::metrics::METRICS;
use crate::keys::record::{BoundKey, Service};
use crate::queue::Admission;
use crate::state::AppState;
use axum::{body::Body, response::Response};
use bytes::Bytes;
use futures_util::StreamExt;
use http::{header, HeaderMap, StatusCode};
use secrecy::ExposeSecret;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Headers never forwarded from upstream to the client. Auth material is
/// stripped alongside the usual hop-by-hop set; content-length is restated
/// after post-processing.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
    "authorization",
    "x-api-key",
    "x-goog-api-key",
];

fn upstream_path(ctx: &RequestContext) -> String {
    match ctx.outbound_api {
        ApiDialect::OpenAi => "/v1/chat/completions".to_string(),
        ApiDialect::OpenAiText => "/v1/completions".to_string(),
        ApiDialect::OpenAiImage => "/v1/images/generations".to_string(),
        ApiDialect::AnthropicText => "/v1/complete".to_string(),
        ApiDialect::AnthropicChat => "/v1/messages".to_string(),
        ApiDialect::GoogleAi => {
            let verb = if ctx.is_streaming {
                "streamGenerateContent?alt=sse"
            } else {
                "generateContent"
            };
            format!("/v1beta/models/{}:{}", ctx.model, verb)
        }
    }
}

fn request_deadline(state: &AppState, ctx: &RequestContext) -> Duration {
    if ctx.is_streaming {
        Duration::from_secs(state.config.server.streaming_timeout_secs)
    } else {
        Duration::from_secs(state.config.server.request_timeout_secs)
    }
}

/// Rules 4-5: bind the secret under the service's expected scheme and
/// finalize the outbound body.
fn build_request(
    state: &AppState,
    ctx: &RequestContext,
    key: &BoundKey,
    body: &Value,
) -> Result<reqwest::RequestBuilder> {
    let provider = state
        .pool
        .provider(ctx.service)
        .ok_or_else(|| AppError::NoKeysAvailable {
            service: ctx.service.to_string(),
        })?;
    let url = format!(
        "{}{}",
        provider.base_url().trim_end_matches('/'),
        upstream_path(ctx)
    );

    let request = state
        .http_client
        .post(&url)
        .json(body)
        .timeout(request_deadline(state, ctx));

    Ok(match ctx.service {
        Service::OpenAi => request.bearer_auth(key.secret.expose_secret()),
        Service::Anthropic => request
            .header("x-api-key", key.secret.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION),
        Service::GoogleAi => request.query(&[("key", key.secret.expose_secret())]),
    })
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("text/event-stream"))
}

/// Output tokens as reported by the upstream, across dialects.
fn reported_output_tokens(body: &Value) -> Option<u64> {
    body.pointer("/usage/completion_tokens")
        .or_else(|| body.pointer("/usage/output_tokens"))
        .or_else(|| body.pointer("/usageMetadata/candidatesTokenCount"))
        .and_then(Value::as_u64)
}

/// Dispatch a prepared request using the admitted key, applying pool signals
/// from the response chain and retrying within the configured bounds.
pub async fn dispatch(
    state: &Arc<AppState>,
    ctx: &mut RequestContext,
    body: &Value,
    admission: Admission,
) -> Result<Response> {
    let Admission { key, permit: _permit } = admission;
    ctx.bind(key);

    let max_rate_limit_retries = state.config.server.max_rate_limit_retries;
    let mut rate_limit_attempts = 0u32;
    let mut server_retry_done = false;

    loop {
        let key = ctx
            .key
            .clone()
            .ok_or_else(|| AppError::internal("dispatch without a bound key"))?;

        info!(
            correlation_id = %ctx.correlation_id,
            key.hash = %key.hash,
            model = %ctx.model,
            outbound = %ctx.outbound_api,
            "Forwarding request upstream"
        );

        let response = match build_request(state, ctx, &key, body)?.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                // Deadline exceeded is not the key's fault.
                return Err(AppError::Timeout {
                    timeout_secs: request_deadline(state, ctx).as_secs(),
                });
            }
            Err(e) => {
                warn!(
                    correlation_id = %ctx.correlation_id,
                    key.hash = %key.hash,
                    error = %e,
                    "Upstream transport error"
                );
                if !server_retry_done {
                    server_retry_done = true;
                    if let Ok(fresh) = state.pool.get(&ctx.model) {
                        ctx.bind(fresh);
                        continue;
                    }
                }
                return Err(AppError::from(e));
            }
        };

        let status = response.status();
        let headers = response.headers().clone();

        if ctx.is_streaming && status.is_success() && is_event_stream(&headers) {
            state.pool.increment_prompt(&key);
            state.pool.update_rate_limits(&key, &headers);
            return stream_response(state, ctx, &key, response);
        }

        let body_bytes = response.bytes().await.map_err(AppError::from)?;
        let action = analyze(&state.response_handlers, status, &headers, &body_bytes);
        debug!(
            correlation_id = %ctx.correlation_id,
            status = status.as_u16(),
            action = ?action,
            "Analyzed upstream response"
        );

        match action {
            Action::Success => {
                state.pool.increment_prompt(&key);
                let parsed: Option<Value> = serde_json::from_slice(&body_bytes).ok();
                let output_tokens = parsed
                    .as_ref()
                    .and_then(reported_output_tokens)
                    .unwrap_or(0);
                ctx.output_tokens = output_tokens as usize;
                if output_tokens > 0 {
                    state.pool.increment_usage(&key, &ctx.model, output_tokens);
                }
                state.pool.update_rate_limits(&key, &headers);
                return postprocess(ctx, status, &headers, body_bytes, parsed);
            }
            Action::DisableKeyAndRetry => {
                warn!(
                    correlation_id = %ctx.correlation_id,
                    key.hash = %key.hash,
                    "Upstream rejected credential; disabling"
                );
                state.pool.disable(&key);
                METRICS.upstream_retries_total.increment(1);
                match state.pool.get(&ctx.model) {
                    Ok(fresh) => ctx.bind(fresh),
                    Err(_) => return passthrough(status, &headers, body_bytes),
                }
            }
            Action::RevokeKeyAndRetry => {
                warn!(
                    correlation_id = %ctx.correlation_id,
                    key.hash = %key.hash,
                    "Upstream reported billing failure; revoking"
                );
                state.pool.revoke(&key);
                METRICS.upstream_retries_total.increment(1);
                match state.pool.get(&ctx.model) {
                    Ok(fresh) => ctx.bind(fresh),
                    Err(_) => return passthrough(status, &headers, body_bytes),
                }
            }
            Action::RateLimitedRetry => {
                state.pool.mark_rate_limited(&key);
                METRICS.upstream_retries_total.increment(1);
                rate_limit_attempts += 1;
                if rate_limit_attempts > max_rate_limit_retries {
                    return passthrough(status, &headers, body_bytes);
                }
                let wait = state
                    .pool
                    .get_lockout_period(ctx.service, &ctx.model)
                    .min(Duration::from_secs(5));
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
                match state.pool.get(&ctx.model) {
                    Ok(fresh) => ctx.bind(fresh),
                    Err(_) => return passthrough(status, &headers, body_bytes),
                }
            }
            Action::ConcurrencyLimitedRetry => {
                // The reuse throttle armed at selection is the only penalty:
                // a concurrency 429 says nothing about the key's quota.
                rate_limit_attempts += 1;
                if rate_limit_attempts > max_rate_limit_retries {
                    return passthrough(status, &headers, body_bytes);
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
                match state.pool.get(&ctx.model) {
                    Ok(fresh) => ctx.bind(fresh),
                    Err(_) => return passthrough(status, &headers, body_bytes),
                }
            }
            Action::RetryOnceFresh => {
                if server_retry_done {
                    return passthrough(status, &headers, body_bytes);
                }
                server_retry_done = true;
                match state.pool.get(&ctx.model) {
                    Ok(fresh) => ctx.bind(fresh),
                    Err(_) => return passthrough(status, &headers, body_bytes),
                }
            }
            Action::Passthrough => return passthrough(status, &headers, body_bytes),
        }
    }
}

/// Forward an upstream response unchanged, minus hop-by-hop headers.
fn passthrough(status: StatusCode, headers: &HeaderMap, body: Bytes) -> Result<Response> {
    let mut builder = Response::builder().status(status);
    if let Some(out_headers) = builder.headers_mut() {
        for (name, value) in headers {
            if !HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
                out_headers.insert(name.clone(), value.clone());
            }
        }
    }
    builder
        .body(Body::from(body))
        .map_err(|e| AppError::internal(format!("failed to build client response: {e}")))
}

/// Buffered post-processing: reshape the body back into the client's dialect
/// when the pair is non-identity, otherwise return the upstream body
/// verbatim.
fn postprocess(
    ctx: &RequestContext,
    status: StatusCode,
    headers: &HeaderMap,
    raw: Bytes,
    parsed: Option<Value>,
) -> Result<Response> {
    if ctx.inbound_api == ctx.outbound_api {
        return passthrough(status, headers, raw);
    }
    let Some(upstream_body) = parsed else {
        warn!(
            correlation_id = %ctx.correlation_id,
            "Upstream 2xx body is not JSON; passing through"
        );
        return passthrough(status, headers, raw);
    };
    match TRANSFORMS.translate_response(ctx.inbound_api, ctx.outbound_api, &upstream_body) {
        Ok(reshaped) => {
            let bytes = serde_json::to_vec(&reshaped)?;
            Response::builder()
                .status(status)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(bytes))
                .map_err(|e| AppError::internal(format!("failed to build client response: {e}")))
        }
        Err(e) => {
            warn!(
                correlation_id = %ctx.correlation_id,
                error = %e,
                "Response reshape failed; passing through"
            );
            passthrough(status, headers, raw)
        }
    }
}

/// Wrap the upstream event stream with the per-chunk transformer for this
/// dialect pair, forwarding chunks as they arrive and settling usage
/// accounting when the stream ends.
fn stream_response(
    state: &Arc<AppState>,
    ctx: &RequestContext,
    key: &BoundKey,
    upstream: reqwest::Response,
) -> Result<Response> {
    let identity = ctx.inbound_api == ctx.outbound_api;
    let transform = stream_transform(ctx.inbound_api, ctx.outbound_api)
        .ok_or_else(|| AppError::unsupported(ctx.inbound_api.as_str(), ctx.outbound_api.as_str()))?;

    // OpenAI-dialect clients expect a terminating [DONE]; Anthropic and
    // Google upstreams never send one.
    let needs_done = !identity
        && matches!(ctx.inbound_api, ApiDialect::OpenAi | ApiDialect::OpenAiText);
    let done_seen = Arc::new(AtomicBool::new(false));
    let output_chars = Arc::new(AtomicUsize::new(0));

    let mut codec = SseCodec::new();
    let correlation_id = ctx.correlation_id;
    let done_seen_map = Arc::clone(&done_seen);
    let chars_map = Arc::clone(&output_chars);

    let transformed = upstream.bytes_stream().map(move |result| match result {
        Ok(chunk) => {
            if identity {
                return Ok::<Bytes, std::io::Error>(chunk);
            }
            let mut out = String::new();
            for payload in codec.push(&chunk) {
                if payload == DONE_MARKER {
                    done_seen_map.store(true, Ordering::Relaxed);
                    out.push_str(&encode_done());
                    continue;
                }
                let event: Value = match serde_json::from_str(&payload) {
                    Ok(v) => v,
                    Err(_) => {
                        debug!(
                            correlation_id = %correlation_id,
                            "Skipping non-JSON stream payload"
                        );
                        continue;
                    }
                };
                match transform(&event) {
                    Ok(Some(mapped)) => {
                        if let Some(text) = output_text(&mapped) {
                            chars_map.fetch_add(text.chars().count(), Ordering::Relaxed);
                        }
                        out.push_str(&encode_event(&mapped));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        debug!(
                            correlation_id = %correlation_id,
                            error = %e,
                            "Stream event transform failed; skipping"
                        );
                    }
                }
            }
            Ok(Bytes::from(out))
        }
        Err(e) => Err(std::io::Error::new(std::io::ErrorKind::Other, e)),
    });

    // Tail frame: settle usage accounting and synthesise the [DONE] marker
    // when the upstream dialect has none.
    let pool = Arc::clone(&state.pool);
    let key_hash = key.clone();
    let model = ctx.model.clone();
    let tail = futures::stream::once(async move {
        let chars = output_chars.load(Ordering::Relaxed);
        if chars > 0 {
            // Streamed usage is estimated; buffered responses use upstream
            // usage fields instead.
            pool.increment_usage(&key_hash, &model, (chars / 4).max(1) as u64);
        }
        let tail_bytes = if needs_done && !done_seen.load(Ordering::Relaxed) {
            Bytes::from(encode_done())
        } else {
            Bytes::new()
        };
        Ok::<Bytes, std::io::Error>(tail_bytes)
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(transformed.chain(tail)))
        .map_err(|e| AppError::internal(format!("failed to build streaming response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CorrelationId;
    use crate::dialect::ApiDialect;

    fn ctx(outbound: ApiDialect, model: &str, streaming: bool) -> RequestContext {
        RequestContext::new(
            CorrelationId::new(),
            ApiDialect::OpenAi,
            outbound,
            match outbound {
                ApiDialect::AnthropicText | ApiDialect::AnthropicChat => Service::Anthropic,
                ApiDialect::GoogleAi => Service::GoogleAi,
                _ => Service::OpenAi,
            },
            model.to_string(),
            streaming,
        )
    }

    #[test]
    fn upstream_paths_by_dialect() {
        assert_eq!(
            upstream_path(&ctx(ApiDialect::OpenAi, "gpt-4", false)),
            "/v1/chat/completions"
        );
        assert_eq!(
            upstream_path(&ctx(ApiDialect::AnthropicText, "claude-2", false)),
            "/v1/complete"
        );
        assert_eq!(
            upstream_path(&ctx(ApiDialect::AnthropicChat, "claude-3-opus-20240229", false)),
            "/v1/messages"
        );
        assert_eq!(
            upstream_path(&ctx(ApiDialect::GoogleAi, "gemini-pro", true)),
            "/v1beta/models/gemini-pro:streamGenerateContent?alt=sse"
        );
    }

    #[test]
    fn reported_tokens_cover_all_dialects() {
        let openai = serde_json::json!({"usage": {"completion_tokens": 7}});
        let anthropic = serde_json::json!({"usage": {"output_tokens": 9}});
        let google = serde_json::json!({"usageMetadata": {"candidatesTokenCount": 11}});
        assert_eq!(reported_output_tokens(&openai), Some(7));
        assert_eq!(reported_output_tokens(&anthropic), Some(9));
        assert_eq!(reported_output_tokens(&google), Some(11));
        assert_eq!(reported_output_tokens(&serde_json::json!({})), None);
    }

    #[test]
    fn passthrough_strips_hop_by_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        headers.insert(header::TRANSFER_ENCODING, "chunked".parse().unwrap());
        headers.insert("x-request-id", "abc".parse().unwrap());
        let response =
            passthrough(StatusCode::OK, &headers, Bytes::from_static(b"{}")).unwrap();
        assert!(response.headers().contains_key(header::CONTENT_TYPE));
        assert!(response.headers().contains_key("x-request-id"));
        assert!(!response.headers().contains_key(header::TRANSFER_ENCODING));
    }
}
