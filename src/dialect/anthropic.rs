// src/dialect/anthropic.rs
//
// Translations between OpenAI-shaped chat bodies and the two Anthropic
// dialects, plus the prompt flattening/splitting shared by both directions.
//
// Protocol differences handled here:
//
// | Concern        | OpenAI                       | Anthropic                |
// |----------------|------------------------------|--------------------------|
// | System prompt  | `role: "system"` message     | top-level `system` field |
// | Max tokens     | optional `max_tokens`        | required                 |
// | Finish reasons | `"stop"`, `"length"`         | `"end_turn"`/`"stop_sequence"`, `"max_tokens"` |
// | Text shape     | `choices[].message.content`  | `completion` / `content[].text` |

use crate::error::{AppError, Result};
use crate::tokenizer;
use serde_json::{json, Value};

pub const HUMAN_MARKER: &str = "\n\nHuman:";
pub const ASSISTANT_MARKER: &str = "\n\nAssistant:";

/// Required by the messages API; applied when the caller omits `max_tokens`.
const DEFAULT_MAX_TOKENS: u64 = 4096;

/// Default sampling budget for the legacy text-completion dialect.
const DEFAULT_MAX_TOKENS_TO_SAMPLE: u64 = 1024;

pub fn validate_text(body: &Value) -> Result<()> {
    if body.get("model").and_then(Value::as_str).is_none() {
        return Err(AppError::bad_request("`model` field is required"));
    }
    let prompt = body
        .get("prompt")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::bad_request("`prompt` must be a string"))?;
    if !prompt.contains("Human:") {
        return Err(AppError::bad_request(
            "`prompt` must contain a Human: turn",
        ));
    }
    Ok(())
}

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
        let role = message.get("role").and_then(Value::as_str);
        if !matches!(role, Some("user" | "assistant")) {
            return Err(AppError::bad_request(
                "message `role` must be \"user\" or \"assistant\"",
            ));
        }
    }
    Ok(())
}

/// Flatten an OpenAI messages array into a single Anthropic prompt.
///
/// System content leads the prompt bare; each turn gets a role marker; the
/// prompt is terminated with an open Assistant turn.
pub fn flatten_messages(messages: &[Value]) -> Result<String> {
    let mut prompt = String::new();
    for message in messages {
        let role = message
            .get("role")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::bad_request("message `role` is required"))?;
        let content = message
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::bad_request("message `content` must be a string"))?;
        match role {
            "system" => {
                if !prompt.is_empty() {
                    prompt.push_str("\n\n");
                }
                prompt.push_str(content);
            }
            "user" => {
                prompt.push_str(HUMAN_MARKER);
                prompt.push(' ');
                prompt.push_str(content);
            }
            "assistant" => {
                prompt.push_str(ASSISTANT_MARKER);
                prompt.push(' ');
                prompt.push_str(content);
            }
            other => {
                return Err(AppError::bad_request(format!(
                    "unsupported message role '{other}'"
                )))
            }
        }
    }
    prompt.push_str(ASSISTANT_MARKER);
    Ok(prompt)
}

/// Split a flattened prompt back into (system, alternating messages).
///
/// The inverse of `flatten_messages` modulo whitespace: text before the
/// first Human marker becomes the system prompt, a trailing empty Assistant
/// turn is dropped.
pub fn split_prompt(prompt: &str) -> (Option<String>, Vec<Value>) {
    let mut system = None;
    let mut messages = Vec::new();

    // Positions of every marker, in order.
    let mut cursor = 0usize;
    let mut segments: Vec<(&str, usize, usize)> = Vec::new(); // (role, content_start, content_end)
    let first_marker = prompt
        .find(HUMAN_MARKER)
        .into_iter()
        .chain(prompt.find(ASSISTANT_MARKER))
        .min();
    if let Some(first) = first_marker {
        let head = prompt[..first].trim();
        if !head.is_empty() {
            system = Some(head.to_string());
        }
        cursor = first;
    }

    while cursor < prompt.len() {
        let rest = &prompt[cursor..];
        let (role, marker) = if rest.starts_with(HUMAN_MARKER) {
            ("user", HUMAN_MARKER)
        } else if rest.starts_with(ASSISTANT_MARKER) {
            ("assistant", ASSISTANT_MARKER)
        } else {
            break;
        };
        let content_start = cursor + marker.len();
        let next = [
            prompt[content_start..].find(HUMAN_MARKER),
            prompt[content_start..].find(ASSISTANT_MARKER),
        ]
        .into_iter()
        .flatten()
        .min()
        .map(|offset| content_start + offset)
        .unwrap_or(prompt.len());
        segments.push((role, content_start, next));
        cursor = next;
    }

    for (role, start, end) in segments {
        let content = prompt[start..end].trim();
        if content.is_empty() && role == "assistant" && end == prompt.len() {
            // Open assistant turn at the tail; the model fills it in.
            continue;
        }
        messages.push(json!({"role": role, "content": content}));
    }

    (system, messages)
}

/// `openai -> anthropic-text`
pub fn openai_to_anthropic_text(body: &Value) -> Result<Value> {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::bad_request("`model` field is required"))?;
    let messages = body
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| AppError::bad_request("`messages` array is required"))?;
    let prompt = flatten_messages(messages)?;

    let mut out = json!({
        "model": model,
        "prompt": prompt,
        "max_tokens_to_sample": body
            .get("max_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_MAX_TOKENS_TO_SAMPLE),
    });
    if let Some(stop) = body.get("stop") {
        out["stop_sequences"] = match stop {
            Value::String(s) => json!([s]),
            other => other.clone(),
        };
    }
    for field in ["temperature", "top_p", "stream"] {
        if let Some(v) = body.get(field) {
            out[field] = v.clone();
        }
    }
    Ok(out)
}

/// `openai -> anthropic-chat`
pub fn openai_to_anthropic_chat(body: &Value) -> Result<Value> {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::bad_request("`model` field is required"))?;
    let raw_messages = body
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| AppError::bad_request("`messages` array is required"))?;

    // System content is a top-level field, not a message role. Multiple
    // system messages are concatenated.
    let mut system_parts: Vec<&str> = Vec::new();
    let mut messages: Vec<Value> = Vec::with_capacity(raw_messages.len());
    for message in raw_messages {
        if message.get("role").and_then(Value::as_str) == Some("system") {
            if let Some(content) = message.get("content").and_then(Value::as_str) {
                system_parts.push(content);
            }
        } else {
            messages.push(message.clone());
        }
    }

    let mut out = json!({
        "model": model,
        "max_tokens": body
            .get("max_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_MAX_TOKENS),
        "messages": messages,
    });
    if !system_parts.is_empty() {
        out["system"] = Value::String(system_parts.join("\n\n"));
    }
    if let Some(stop) = body.get("stop") {
        out["stop_sequences"] = match stop {
            Value::String(s) => json!([s]),
            other => other.clone(),
        };
    }
    for field in ["temperature", "top_p", "stream"] {
        if let Some(v) = body.get(field) {
            out[field] = v.clone();
        }
    }
    Ok(out)
}

/// `anthropic-text -> anthropic-chat`
pub fn anthropic_text_to_chat(body: &Value) -> Result<Value> {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::bad_request("`model` field is required"))?;
    let prompt = body
        .get("prompt")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::bad_request("`prompt` must be a string"))?;
    let (system, messages) = split_prompt(prompt);
    if messages.is_empty() {
        return Err(AppError::bad_request("`prompt` contains no turns"));
    }

    let mut out = json!({
        "model": model,
        "max_tokens": body
            .get("max_tokens_to_sample")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_MAX_TOKENS),
        "messages": messages,
    });
    if let Some(system) = system {
        out["system"] = Value::String(system);
    }
    for (from, to) in [
        ("stop_sequences", "stop_sequences"),
        ("temperature", "temperature"),
        ("top_p", "top_p"),
        ("stream", "stream"),
    ] {
        if let Some(v) = body.get(from) {
            out[to] = v.clone();
        }
    }
    Ok(out)
}

fn map_stop_reason(reason: Option<&str>) -> &'static str {
    match reason {
        Some("max_tokens") => "length",
        // end_turn / stop_sequence / anything else ends the turn normally.
        _ => "stop",
    }
}

/// Text block extracted from a messages-API response `content` array.
fn messages_text(resp: &Value) -> String {
    resp.get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

/// Anthropic text-completion response -> OpenAI chat response.
///
/// Anthropic's text API reports no usage, so the block is synthesised from
/// token estimates. The id and created fields are lossy.
pub fn completion_to_openai_chat(resp: &Value) -> Result<Value> {
    let completion = resp
        .get("completion")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::bad_request("upstream response has no `completion` field"))?;
    let model = resp.get("model").and_then(Value::as_str).unwrap_or("claude");
    let id = resp
        .get("log_id")
        .and_then(Value::as_str)
        .unwrap_or("proxy");
    let completion_tokens = tokenizer::estimate_tokens_anthropic(completion);

    Ok(json!({
        "id": format!("chatcmpl-{id}"),
        "object": "chat.completion",
        "created": 0,
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": completion.trim_start()},
            "finish_reason": map_stop_reason(resp.get("stop_reason").and_then(Value::as_str)),
        }],
        "usage": {
            "prompt_tokens": 0,
            "completion_tokens": completion_tokens,
            "total_tokens": completion_tokens,
        },
    }))
}

/// Anthropic messages response -> OpenAI chat response.
pub fn messages_to_openai_chat(resp: &Value) -> Result<Value> {
    let text = messages_text(resp);
    let model = resp.get("model").and_then(Value::as_str).unwrap_or("claude");
    let input_tokens = resp
        .pointer("/usage/input_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let output_tokens = resp
        .pointer("/usage/output_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);

    Ok(json!({
        "id": resp.get("id").cloned().unwrap_or_else(|| json!("chatcmpl-proxy")),
        "object": "chat.completion",
        "created": 0,
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": map_stop_reason(resp.get("stop_reason").and_then(Value::as_str)),
        }],
        "usage": {
            "prompt_tokens": input_tokens,
            "completion_tokens": output_tokens,
            "total_tokens": input_tokens + output_tokens,
        },
    }))
}

/// Anthropic messages response -> legacy text-completion response.
pub fn messages_to_completion(resp: &Value) -> Result<Value> {
    let text = messages_text(resp);
    let stop_reason = match resp.get("stop_reason").and_then(Value::as_str) {
        Some("max_tokens") => "max_tokens",
        _ => "stop_sequence",
    };
    Ok(json!({
        "type": "completion",
        "id": resp.get("id").cloned().unwrap_or_else(|| json!("compl-proxy")),
        "completion": text,
        "stop_reason": stop_reason,
        "model": resp.get("model").cloned().unwrap_or_else(|| json!("claude")),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flatten_terminates_with_open_assistant_turn() {
        let messages = vec![
            json!({"role": "system", "content": "Be terse."}),
            json!({"role": "user", "content": "hi"}),
        ];
        let prompt = flatten_messages(&messages).unwrap();
        assert!(prompt.starts_with("Be terse."));
        assert!(prompt.contains("\n\nHuman: hi"));
        assert!(prompt.ends_with("\n\nAssistant:"));
    }

    #[test]
    fn split_inverts_flatten_modulo_whitespace() {
        let messages = vec![
            json!({"role": "system", "content": "Be terse."}),
            json!({"role": "user", "content": "first question"}),
            json!({"role": "assistant", "content": "first answer"}),
            json!({"role": "user", "content": "second question"}),
        ];
        let prompt = flatten_messages(&messages).unwrap();
        let (system, turns) = split_prompt(&prompt);
        assert_eq!(system.as_deref(), Some("Be terse."));
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0], json!({"role": "user", "content": "first question"}));
        assert_eq!(turns[1], json!({"role": "assistant", "content": "first answer"}));
        assert_eq!(turns[2], json!({"role": "user", "content": "second question"}));
    }

    #[test]
    fn openai_to_text_maps_stop_and_max_tokens() {
        let body = json!({
            "model": "claude-2",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 256,
            "stop": "###",
        });
        let out = openai_to_anthropic_text(&body).unwrap();
        assert_eq!(out["max_tokens_to_sample"], 256);
        assert_eq!(out["stop_sequences"], json!(["###"]));
        let prompt = out["prompt"].as_str().unwrap();
        assert!(prompt.contains("\n\nHuman: hi"));
        assert!(prompt.ends_with("\n\nAssistant:"));
    }

    #[test]
    fn openai_to_chat_extracts_system_to_top_level() {
        let body = json!({
            "model": "claude-3-opus-20240229",
            "messages": [
                {"role": "system", "content": "Part one."},
                {"role": "system", "content": "Part two."},
                {"role": "user", "content": "Hello"},
            ],
        });
        let out = openai_to_anthropic_chat(&body).unwrap();
        assert_eq!(out["system"], "Part one.\n\nPart two.");
        let messages = out["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(out["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn text_to_chat_preserves_system_prompt() {
        let body = json!({
            "model": "claude-3-opus-20240229",
            "prompt": "You are helpful.\n\nHuman: hi\n\nAssistant:",
            "max_tokens_to_sample": 128,
        });
        let out = anthropic_text_to_chat(&body).unwrap();
        assert_eq!(out["system"], "You are helpful.");
        assert_eq!(out["max_tokens"], 128);
        assert_eq!(out["messages"], json!([{"role": "user", "content": "hi"}]));
    }

    #[test]
    fn completion_reshapes_into_choices() {
        let resp = json!({
            "completion": " Hello there!",
            "stop_reason": "stop_sequence",
            "model": "claude-2",
        });
        let out = completion_to_openai_chat(&resp).unwrap();
        assert_eq!(out["choices"][0]["message"]["content"], "Hello there!");
        assert_eq!(out["choices"][0]["finish_reason"], "stop");
        assert!(out["usage"]["completion_tokens"].as_u64().unwrap() > 0);
    }

    #[test]
    fn messages_response_maps_usage_and_finish_reason() {
        let resp = json!({
            "id": "msg_123",
            "model": "claude-3-opus-20240229",
            "content": [{"type": "text", "text": "Hi!"}],
            "stop_reason": "max_tokens",
            "usage": {"input_tokens": 10, "output_tokens": 5},
        });
        let out = messages_to_openai_chat(&resp).unwrap();
        assert_eq!(out["id"], "msg_123");
        assert_eq!(out["choices"][0]["finish_reason"], "length");
        assert_eq!(out["usage"]["total_tokens"], 15);
    }

    #[test]
    fn messages_to_completion_keeps_text_dialect_shape() {
        let resp = json!({
            "id": "msg_9",
            "model": "claude-3-sonnet-20240229",
            "content": [{"type": "text", "text": "Hello"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 2, "output_tokens": 1},
        });
        let out = messages_to_completion(&resp).unwrap();
        assert_eq!(out["type"], "completion");
        assert_eq!(out["completion"], "Hello");
        assert_eq!(out["stop_reason"], "stop_sequence");
    }

    #[test]
    fn chat_validation_rejects_foreign_roles() {
        let body = json!({
            "model": "claude-3-opus-20240229",
            "messages": [{"role": "tool", "content": "x"}],
        });
        assert!(validate_chat(&body).is_err());
    }
}
