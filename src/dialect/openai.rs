// src/dialect/openai.rs

use crate::error::{AppError, Result};
use serde_json::{json, Value};

pub fn validate_chat(body: &Value) -> Result<()> {
    if body.get("model").and_then(Value::as_str).is_none() {
        return Err(AppError::bad_request("`model` field is required"));
    }
    let messages = body
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| AppError::bad_request("`messages` array is required"))?;
    if messages.is_empty() {
        return Err(AppError::bad_request("`messages` must not be empty"));
    }
    for message in messages {
        if message.get("role").and_then(Value::as_str).is_none() {
            return Err(AppError::bad_request("message `role` is required"));
        }
        if message.get("content").and_then(Value::as_str).is_none() {
            return Err(AppError::bad_request("message `content` must be a string"));
        }
    }
    Ok(())
}

pub fn validate_text(body: &Value) -> Result<()> {
    if body.get("model").and_then(Value::as_str).is_none() {
        return Err(AppError::bad_request("`model` field is required"));
    }
    if body.get("prompt").and_then(Value::as_str).is_none() {
        return Err(AppError::bad_request("`prompt` must be a string"));
    }
    Ok(())
}

pub fn validate_image(body: &Value) -> Result<()> {
    if body.get("prompt").and_then(Value::as_str).is_none() {
        return Err(AppError::bad_request("`prompt` must be a string"));
    }
    Ok(())
}

/// `openai-text -> openai`: wrap the prompt into a single user message.
pub fn text_to_chat_request(body: &Value) -> Result<Value> {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::bad_request("`model` field is required"))?;
    let prompt = body
        .get("prompt")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::bad_request("`prompt` must be a string"))?;

    let mut out = json!({
        "model": model,
        "messages": [{"role": "user", "content": prompt}],
    });
    for field in ["max_tokens", "temperature", "top_p", "stop", "stream", "n"] {
        if let Some(v) = body.get(field) {
            out[field] = v.clone();
        }
    }
    Ok(out)
}

/// OpenAI chat response -> legacy text-completion response.
pub fn chat_to_text_response(resp: &Value) -> Result<Value> {
    let choices = resp
        .get("choices")
        .and_then(Value::as_array)
        .ok_or_else(|| AppError::bad_request("upstream response has no `choices`"))?;
    let mapped: Vec<Value> = choices
        .iter()
        .enumerate()
        .map(|(index, choice)| {
            json!({
                "index": index,
                "text": choice.pointer("/message/content").cloned().unwrap_or(json!("")),
                "finish_reason": choice.get("finish_reason").cloned().unwrap_or(Value::Null),
                "logprobs": Value::Null,
            })
        })
        .collect();

    Ok(json!({
        "id": resp.get("id").cloned().unwrap_or(json!("cmpl-proxy")),
        "object": "text_completion",
        "created": resp.get("created").cloned().unwrap_or(json!(0)),
        "model": resp.get("model").cloned().unwrap_or(Value::Null),
        "choices": mapped,
        "usage": resp.get("usage").cloned().unwrap_or(Value::Null),
    }))
}
