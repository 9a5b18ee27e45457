// src/handler.rs
//
// Inbound HTTP surface. Each endpoint names its inbound dialect and feeds
// the shared pipeline: preprocess -> queue -> dispatch.

use crate::context::CorrelationId;
use crate::dialect::ApiDialect;
use crate::error::Result;
use crate::metrics::METRICS;
use crate::preprocess;
use crate::state::AppState;
use crate::upstream;
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::StatusCode,
    response::Response,
    Extension, Json,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::instrument;

/// The `/v1/complete` compatibility endpoint forces this model.
const CLAUDE3_COMPAT_MODEL: &str = "claude-3-sonnet-20240229";

/// How long a synthesised model listing stays fresh.
const MODELS_CACHE_TTL: Duration = Duration::from_secs(60);

/// Model ids claimed per capability family in the synthesised listing.
const FAMILY_MODELS: &[(&str, &[&str])] = &[
    ("gpt-4", &["gpt-4", "gpt-4-0613"]),
    ("gpt-4-turbo", &["gpt-4-turbo", "gpt-4-turbo-preview"]),
    ("gpt-3.5-turbo", &["gpt-3.5-turbo", "gpt-3.5-turbo-16k", "gpt-3.5-turbo-instruct"]),
    ("embeddings", &["text-embedding-ada-002"]),
    ("image", &["dall-e-3"]),
    ("audio", &["whisper-1", "tts-1"]),
    ("text-moderation", &["text-moderation-latest"]),
    (
        "claude",
        &[
            "claude-2",
            "claude-2.1",
            "claude-instant-1.2",
            "claude-3-sonnet-20240229",
            "claude-3-haiku-20240307",
        ],
    ),
    ("claude-opus", &["claude-3-opus-20240229"]),
    ("gemini-pro", &["gemini-pro", "gemini-1.5-pro"]),
    ("gemini-flash", &["gemini-1.5-flash"]),
    ("gemini-ultra", &["gemini-ultra"]),
];

/// Lightweight liveness probe.
pub async fn health_check() -> Response {
    let mut resp = Response::new(Body::from("OK"));
    *resp.status_mut() = StatusCode::OK;
    resp
}

/// `GET /v1/models`: models claimed across all providers with usable keys,
/// cached for a minute.
pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<Value> {
    {
        let cache = state
            .models_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some((built_at, listing)) = cache.as_ref() {
            if built_at.elapsed() < MODELS_CACHE_TTL {
                return Json(listing.clone());
            }
        }
    }

    let mut claimed: Vec<Value> = Vec::new();
    for service in state.pool.services() {
        let Some(provider) = state.pool.provider(service) else {
            continue;
        };
        if provider.available() == 0 {
            continue;
        }
        let mut families: Vec<String> = provider
            .list()
            .into_iter()
            .filter(|view| !view.is_disabled)
            .flat_map(|view| view.model_families.into_iter())
            .collect();
        families.sort();
        families.dedup();
        for family in families {
            if let Some((_, models)) = FAMILY_MODELS.iter().find(|(f, _)| *f == family) {
                for model in *models {
                    claimed.push(json!({
                        "id": model,
                        "object": "model",
                        "owned_by": service.as_str(),
                    }));
                }
            }
        }
    }

    let listing = json!({"object": "list", "data": claimed});
    let mut cache = state
        .models_cache
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    *cache = Some((Instant::now(), listing.clone()));
    Json(listing)
}

/// Correlation id minted by the edge middleware, or a fresh one when the
/// router runs without it (tests drive `create_router` bare).
fn correlation_id(ext: Option<Extension<CorrelationId>>) -> CorrelationId {
    ext.map_or_else(CorrelationId::new, |Extension(id)| id)
}

/// `POST /v1/chat/completions` — inbound `openai`.
#[instrument(skip_all)]
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    correlation: Option<Extension<CorrelationId>>,
    body: Bytes,
) -> Response {
    handle_proxy(state, ApiDialect::OpenAi, body, None, correlation_id(correlation)).await
}

/// `POST /v1/completions` — inbound `openai-text`.
#[instrument(skip_all)]
pub async fn text_completions(
    State(state): State<Arc<AppState>>,
    correlation: Option<Extension<CorrelationId>>,
    body: Bytes,
) -> Response {
    handle_proxy(state, ApiDialect::OpenAiText, body, None, correlation_id(correlation)).await
}

/// `POST /v1/images/generations` — inbound `openai-image`.
#[instrument(skip_all)]
pub async fn image_generations(
    State(state): State<Arc<AppState>>,
    correlation: Option<Extension<CorrelationId>>,
    body: Bytes,
) -> Response {
    handle_proxy(state, ApiDialect::OpenAiImage, body, None, correlation_id(correlation)).await
}

/// `POST /v1/complete` — inbound `anthropic-text`. Claude 3 models are
/// upgraded to the messages dialect by the preprocessor.
#[instrument(skip_all)]
pub async fn anthropic_complete(
    State(state): State<Arc<AppState>>,
    correlation: Option<Extension<CorrelationId>>,
    body: Bytes,
) -> Response {
    handle_proxy(
        state,
        ApiDialect::AnthropicText,
        body,
        None,
        correlation_id(correlation),
    )
    .await
}

/// `POST /v1/messages` — inbound `anthropic-chat`.
#[instrument(skip_all)]
pub async fn anthropic_messages(
    State(state): State<Arc<AppState>>,
    correlation: Option<Extension<CorrelationId>>,
    body: Bytes,
) -> Response {
    handle_proxy(
        state,
        ApiDialect::AnthropicChat,
        body,
        None,
        correlation_id(correlation),
    )
    .await
}

/// `POST /v1/claude-3/complete` — compatibility endpoint: forces the model
/// and translates text to chat both directions.
#[instrument(skip_all)]
pub async fn claude3_complete(
    State(state): State<Arc<AppState>>,
    correlation: Option<Extension<CorrelationId>>,
    body: Bytes,
) -> Response {
    handle_proxy(
        state,
        ApiDialect::AnthropicText,
        body,
        Some(CLAUDE3_COMPAT_MODEL),
        correlation_id(correlation),
    )
    .await
}

/// The shared pipeline entry. Errors are rendered here, with the request's
/// correlation id, so the `request_id` a client sees matches the log
/// records for the same request.
async fn handle_proxy(
    state: Arc<AppState>,
    inbound: ApiDialect,
    body: Bytes,
    model_override: Option<&str>,
    correlation_id: CorrelationId,
) -> Response {
    let started = Instant::now();
    METRICS.requests_total.increment(1);

    match run_pipeline(&state, inbound, &body, model_override, correlation_id).await {
        Ok(response) => {
            METRICS.request_duration.record(started.elapsed().as_secs_f64());
            response
        }
        Err(err) => err.into_response_with_id(correlation_id),
    }
}

/// Preprocess, wait in the service queue, dispatch.
async fn run_pipeline(
    state: &Arc<AppState>,
    inbound: ApiDialect,
    body: &Bytes,
    model_override: Option<&str>,
    correlation_id: CorrelationId,
) -> Result<Response> {
    let prepared = preprocess::prepare(
        &state.pool,
        inbound,
        body,
        model_override,
        correlation_id,
        state.config.prompt_logging,
    )?;
    let mut ctx = prepared.ctx;

    let admission = state.queues.admit(ctx.service, &ctx.model).await?;
    let response = upstream::dispatch(state, &mut ctx, &prepared.body, admission).await?;

    if let Some(wait) = ctx.wait_time() {
        METRICS.queue_wait.record(wait.as_secs_f64());
    }
    Ok(response)
}
