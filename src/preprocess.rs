// src/preprocess.rs
//
// Pre-queue half of the pipeline: parse and validate the inbound body,
// estimate its token cost, pick the target service and outbound dialect, and
// translate the body. Key binding and authorization stamping happen after
// dequeue, in the upstream module, so scarce credentials are bound at the
// latest possible moment.

use crate::context::{CorrelationId, RequestContext};
use crate::dialect::{self, streaming, ApiDialect, TRANSFORMS};
use crate::error::{AppError, Result};
use crate::keys::pool::KeyPool;
use crate::keys::record::Service;
use crate::tokenizer;
use serde_json::Value;
use tracing::{debug, info};

/// A request that has passed rules 1-3 and is ready to join its service's
/// queue.
#[derive(Debug)]
pub struct PreparedRequest {
    pub ctx: RequestContext,
    /// Body already translated into the outbound dialect.
    pub body: Value,
}

/// Pick the outbound dialect for a validated request.
///
/// Claude 3 models only exist behind the messages API, so text-completion
/// traffic for them is transparently upgraded to `anthropic-chat`.
fn outbound_for(service: Service, inbound: ApiDialect, model: &str) -> ApiDialect {
    match service {
        Service::OpenAi => match inbound {
            ApiDialect::OpenAiImage => ApiDialect::OpenAiImage,
            // Legacy text-completion traffic rides the chat endpoint.
            _ => ApiDialect::OpenAi,
        },
        Service::Anthropic => {
            if inbound == ApiDialect::AnthropicChat || model.starts_with("claude-3") {
                ApiDialect::AnthropicChat
            } else {
                ApiDialect::AnthropicText
            }
        }
        Service::GoogleAi => ApiDialect::GoogleAi,
    }
}

/// Run rules 1-3 of the preprocessor over a raw inbound body.
pub fn prepare(
    pool: &KeyPool,
    inbound: ApiDialect,
    raw_body: &[u8],
    model_override: Option<&str>,
    correlation_id: CorrelationId,
    prompt_logging: bool,
) -> Result<PreparedRequest> {
    let mut body: Value = serde_json::from_slice(raw_body)
        .map_err(|e| AppError::bad_request(format!("body is not valid JSON: {e}")))?;

    if let Some(model) = model_override {
        body["model"] = Value::String(model.to_string());
    }

    dialect::validate(inbound, &body)?;

    // Image requests may omit the model; the other dialects require it.
    if inbound == ApiDialect::OpenAiImage && body.get("model").is_none() {
        body["model"] = Value::String("dall-e-3".to_string());
    }
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::bad_request("`model` field is required"))?
        .to_string();
    let service = pool.service_for_model(&model)?;
    let outbound = outbound_for(service, inbound, &model);

    // Unknown pairs fail here, at request entry, not at transform time.
    if !TRANSFORMS.supports(inbound, outbound) {
        return Err(AppError::unsupported(inbound.as_str(), outbound.as_str()));
    }

    let is_streaming = body
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if is_streaming && streaming::stream_transform(inbound, outbound).is_none() {
        return Err(AppError::unsupported(inbound.as_str(), outbound.as_str()));
    }

    let prompt_tokens = tokenizer::estimate_prompt_tokens(inbound, &body);
    let translated = TRANSFORMS.translate_request(inbound, outbound, &body)?;

    let mut ctx = RequestContext::new(
        correlation_id,
        inbound,
        outbound,
        service,
        model,
        is_streaming,
    );
    ctx.prompt_tokens = prompt_tokens;

    if prompt_logging {
        info!(
            correlation_id = %ctx.correlation_id,
            model = %ctx.model,
            inbound = %inbound,
            outbound = %outbound,
            prompt_tokens,
            "Accepted prompt"
        );
    } else {
        debug!(
            correlation_id = %ctx.correlation_id,
            model = %ctx.model,
            inbound = %inbound,
            outbound = %outbound,
            "Prepared request"
        );
    }

    Ok(PreparedRequest {
        ctx,
        body: translated,
    })
}
