// src/dialect/google.rs

use crate::error::{AppError, Result};
use serde_json::{json, Value};

/// `openai -> google-ai`: messages become `contents` with `user`/`model`
/// roles; system messages become `systemInstruction`; sampling parameters
/// move into `generationConfig`.
pub fn openai_to_google(body: &Value) -> Result<Value> {
    let raw_messages = body
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| AppError::bad_request("`messages` array is required"))?;

    let mut system_parts: Vec<&str> = Vec::new();
    let mut contents = Vec::with_capacity(raw_messages.len());
    for message in raw_messages {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
        let text = message
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::bad_request("message `content` must be a string"))?;
        match role {
            "system" => system_parts.push(text),
            "assistant" => contents.push(json!({"role": "model", "parts": [{"text": text}]})),
            _ => contents.push(json!({"role": "user", "parts": [{"text": text}]})),
        }
    }

    let mut out = json!({"contents": contents});
    if !system_parts.is_empty() {
        out["systemInstruction"] = json!({"parts": [{"text": system_parts.join("\n\n")}]});
    }

    let mut generation_config = serde_json::Map::new();
    if let Some(v) = body.get("temperature") {
        generation_config.insert("temperature".to_string(), v.clone());
    }
    if let Some(v) = body.get("top_p") {
        generation_config.insert("topP".to_string(), v.clone());
    }
    if let Some(v) = body.get("max_tokens") {
        generation_config.insert("maxOutputTokens".to_string(), v.clone());
    }
    if let Some(stop) = body.get("stop") {
        let stops = match stop {
            Value::String(s) => json!([s]),
            other => other.clone(),
        };
        generation_config.insert("stopSequences".to_string(), stops);
    }
    if !generation_config.is_empty() {
        out["generationConfig"] = Value::Object(generation_config);
    }
    Ok(out)
}

fn map_finish_reason(reason: Option<&str>) -> &'static str {
    match reason {
        Some("MAX_TOKENS") => "length",
        Some("SAFETY") | Some("RECITATION") => "content_filter",
        _ => "stop",
    }
}

/// Google generateContent response -> OpenAI chat response.
pub fn google_to_openai_chat(resp: &Value) -> Result<Value> {
    let candidate = resp
        .pointer("/candidates/0")
        .ok_or_else(|| AppError::bad_request("upstream response has no candidates"))?;
    let text = candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    let prompt_tokens = resp
        .pointer("/usageMetadata/promptTokenCount")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let completion_tokens = resp
        .pointer("/usageMetadata/candidatesTokenCount")
        .and_then(Value::as_u64)
        .unwrap_or(0);

    Ok(json!({
        "id": "chatcmpl-proxy",
        "object": "chat.completion",
        "created": 0,
        "model": resp.get("modelVersion").cloned().unwrap_or(json!("gemini")),
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": map_finish_reason(
                candidate.get("finishReason").and_then(Value::as_str)
            ),
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens,
        },
    }))
}
