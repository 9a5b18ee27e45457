// src/dialect/streaming.rs
//
// Event-stream decoding and per-dialect chunk transforms.
//
// The codec is deliberately HTTP-free: a transformer is a function from
// (accumulated bytes, new chunk) to (new accumulated bytes, fully-decoded
// output events); the buffer split point is the cursor. `[DONE]` passes
// through unchanged, and unrecognised event shapes are skipped rather than
// killing the stream.

use crate::error::Result;
use crate::dialect::ApiDialect;
use bytes::{Buf, BytesMut};
use serde_json::{json, Value};
use tracing::debug;

pub const DONE_MARKER: &str = "[DONE]";

/// Incremental SSE decoder. Bytes are pushed as they arrive; complete events
/// (blocks delimited by a blank line) come out, partial events stay buffered.
#[derive(Debug, Default)]
pub struct SseCodec {
    buffer: BytesMut,
}

impl SseCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns the `data:` payload of every event completed by
    /// it, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some((end, delim_len)) = find_blank_line(&self.buffer) {
            let block = self.buffer.split_to(end);
            self.buffer.advance(delim_len);
            if let Some(data) = parse_data_lines(&block) {
                events.push(data);
            }
        }
        events
    }

    /// Bytes still waiting for their delimiter.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Find the earliest blank-line delimiter; returns (block end, delimiter len).
fn find_blank_line(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|i| (i + 1, 1));
    let crlf = buf
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| (i + 2, 2));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

/// Join the `data:` field lines of one event block.
fn parse_data_lines(block: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(block).ok()?;
    let payload: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim_start)
        .collect();
    if payload.is_empty() {
        None
    } else {
        Some(payload.join("\n"))
    }
}

/// Re-encode a JSON event as an SSE frame.
pub fn encode_event(event: &Value) -> String {
    format!("data: {event}\n\n")
}

pub fn encode_done() -> String {
    format!("data: {DONE_MARKER}\n\n")
}

/// Per-event transform for one (inbound, outbound) dialect pair. `Ok(None)`
/// means the event has no counterpart in the client dialect and is skipped.
pub type EventTransform = fn(&Value) -> Result<Option<Value>>;

fn identity_event(event: &Value) -> Result<Option<Value>> {
    Ok(Some(event.clone()))
}

/// Look up the streaming transform for a dialect pair.
pub fn stream_transform(inbound: ApiDialect, outbound: ApiDialect) -> Option<EventTransform> {
    use ApiDialect::*;
    if inbound == outbound {
        return Some(identity_event);
    }
    match (inbound, outbound) {
        (OpenAi, AnthropicText) => Some(completion_event_to_openai_chunk),
        (OpenAi, AnthropicChat) => Some(messages_event_to_openai_chunk),
        (AnthropicText, AnthropicChat) => Some(messages_event_to_completion_event),
        (OpenAi, GoogleAi) => Some(google_chunk_to_openai_chunk),
        (OpenAiText, OpenAi) => Some(identity_event),
        _ => None,
    }
}

fn openai_chunk(content: Option<&str>, role: Option<&str>, finish: Option<&str>) -> Value {
    let mut delta = serde_json::Map::new();
    if let Some(role) = role {
        delta.insert("role".to_string(), json!(role));
    }
    if let Some(content) = content {
        delta.insert("content".to_string(), json!(content));
    }
    json!({
        "id": "chatcmpl-proxy",
        "object": "chat.completion.chunk",
        "created": 0,
        "choices": [{
            "index": 0,
            "delta": Value::Object(delta),
            "finish_reason": finish.map_or(Value::Null, |f| json!(f)),
        }],
    })
}

fn map_anthropic_stop(reason: Option<&str>) -> &'static str {
    match reason {
        Some("max_tokens") => "length",
        _ => "stop",
    }
}

/// Anthropic text-completion event -> OpenAI chat chunk.
fn completion_event_to_openai_chunk(event: &Value) -> Result<Option<Value>> {
    if let Some(completion) = event.get("completion").and_then(Value::as_str) {
        let finish = event
            .get("stop_reason")
            .and_then(Value::as_str)
            .map(|r| map_anthropic_stop(Some(r)));
        return Ok(Some(openai_chunk(Some(completion), None, finish)));
    }
    debug!(event = %event, "Skipping unrecognised completion stream event");
    Ok(None)
}

/// Anthropic messages event -> OpenAI chat chunk.
fn messages_event_to_openai_chunk(event: &Value) -> Result<Option<Value>> {
    match event.get("type").and_then(Value::as_str) {
        Some("message_start") => Ok(Some(openai_chunk(Some(""), Some("assistant"), None))),
        Some("content_block_delta") => {
            let text = event
                .pointer("/delta/text")
                .and_then(Value::as_str)
                .unwrap_or_default();
            Ok(Some(openai_chunk(Some(text), None, None)))
        }
        Some("message_delta") => {
            match event.pointer("/delta/stop_reason").and_then(Value::as_str) {
                Some(reason) => Ok(Some(openai_chunk(
                    None,
                    None,
                    Some(map_anthropic_stop(Some(reason))),
                ))),
                None => Ok(None),
            }
        }
        Some("ping" | "content_block_start" | "content_block_stop" | "message_stop") => Ok(None),
        _ => {
            debug!(event = %event, "Skipping unrecognised messages stream event");
            Ok(None)
        }
    }
}

/// Anthropic messages event -> text-completion event.
fn messages_event_to_completion_event(event: &Value) -> Result<Option<Value>> {
    match event.get("type").and_then(Value::as_str) {
        Some("content_block_delta") => {
            let text = event
                .pointer("/delta/text")
                .and_then(Value::as_str)
                .unwrap_or_default();
            Ok(Some(json!({
                "type": "completion",
                "completion": text,
                "stop_reason": Value::Null,
            })))
        }
        Some("message_delta") => {
            match event.pointer("/delta/stop_reason").and_then(Value::as_str) {
                Some(reason) => {
                    let mapped = match reason {
                        "max_tokens" => "max_tokens",
                        _ => "stop_sequence",
                    };
                    Ok(Some(json!({
                        "type": "completion",
                        "completion": "",
                        "stop_reason": mapped,
                    })))
                }
                None => Ok(None),
            }
        }
        Some(
            "ping" | "message_start" | "content_block_start" | "content_block_stop"
            | "message_stop",
        ) => Ok(None),
        _ => {
            debug!(event = %event, "Skipping unrecognised messages stream event");
            Ok(None)
        }
    }
}

/// Google streamGenerateContent chunk -> OpenAI chat chunk.
fn google_chunk_to_openai_chunk(event: &Value) -> Result<Option<Value>> {
    let Some(candidate) = event.pointer("/candidates/0") else {
        debug!(event = %event, "Skipping unrecognised google stream event");
        return Ok(None);
    };
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
    let finish = candidate
        .get("finishReason")
        .and_then(Value::as_str)
        .map(|r| match r {
            "MAX_TOKENS" => "length",
            _ => "stop",
        });
    Ok(Some(openai_chunk(Some(&text), None, finish)))
}

/// Extract the output text carried by a transformed event, for streaming
/// usage estimates.
pub fn output_text(event: &Value) -> Option<&str> {
    event
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .or_else(|| event.get("completion").and_then(Value::as_str))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_buffers_partial_events() {
        let mut codec = SseCodec::new();
        assert!(codec.push(b"data: {\"a\":").is_empty());
        assert!(codec.pending() > 0);
        let events = codec.push(b"1}\n\ndata: [DONE]\n\n");
        assert_eq!(events, vec![r#"{"a":1}"#.to_string(), DONE_MARKER.to_string()]);
        assert_eq!(codec.pending(), 0);
    }

    #[test]
    fn codec_handles_crlf_delimiters() {
        let mut codec = SseCodec::new();
        let events = codec.push(b"data: one\r\n\r\ndata: two\r\n\r\n");
        assert_eq!(events, vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn codec_ignores_comment_and_event_lines() {
        let mut codec = SseCodec::new();
        let events = codec.push(b": keep-alive\n\nevent: completion\ndata: {\"x\":2}\n\n");
        assert_eq!(events, vec![r#"{"x":2}"#.to_string()]);
    }

    #[test]
    fn chunking_is_transparent_to_the_transform() {
        // R2: transformed concatenation equals transformation of the
        // concatenated original, regardless of chunk boundaries.
        let raw = concat!(
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Hel\"}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"lo\"}}\n\n",
        );
        let transform = stream_transform(ApiDialect::OpenAi, ApiDialect::AnthropicChat).unwrap();

        let collect = |chunks: &[&[u8]]| -> String {
            let mut codec = SseCodec::new();
            let mut out = String::new();
            for chunk in chunks {
                for payload in codec.push(chunk) {
                    let event: Value = serde_json::from_str(&payload).unwrap();
                    if let Some(transformed) = transform(&event).unwrap() {
                        out.push_str(output_text(&transformed).unwrap_or(""));
                    }
                }
            }
            out
        };

        let whole = collect(&[raw.as_bytes()]);
        let bytes = raw.as_bytes();
        let split: Vec<&[u8]> = bytes.chunks(7).collect();
        let piecewise = collect(&split);
        assert_eq!(whole, "Hello");
        assert_eq!(whole, piecewise);
    }

    #[test]
    fn messages_events_map_to_openai_chunks() {
        let transform = stream_transform(ApiDialect::OpenAi, ApiDialect::AnthropicChat).unwrap();

        let start: Value =
            serde_json::from_str(r#"{"type":"message_start","message":{"id":"msg_1"}}"#).unwrap();
        let chunk = transform(&start).unwrap().unwrap();
        assert_eq!(chunk["choices"][0]["delta"]["role"], "assistant");

        let stop: Value =
            serde_json::from_str(r#"{"type":"message_delta","delta":{"stop_reason":"max_tokens"}}"#)
                .unwrap();
        let chunk = transform(&stop).unwrap().unwrap();
        assert_eq!(chunk["choices"][0]["finish_reason"], "length");

        let ping: Value = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(transform(&ping).unwrap().is_none());
    }

    #[test]
    fn unknown_events_are_skipped_not_fatal() {
        let transform = stream_transform(ApiDialect::OpenAi, ApiDialect::AnthropicChat).unwrap();
        let odd: Value = serde_json::from_str(r#"{"type":"totally_new_event"}"#).unwrap();
        assert!(transform(&odd).unwrap().is_none());
    }

    #[test]
    fn completion_events_become_chat_chunks() {
        let transform = stream_transform(ApiDialect::OpenAi, ApiDialect::AnthropicText).unwrap();
        let event: Value =
            serde_json::from_str(r#"{"type":"completion","completion":" Hi","stop_reason":null}"#)
                .unwrap();
        let chunk = transform(&event).unwrap().unwrap();
        assert_eq!(chunk["object"], "chat.completion.chunk");
        assert_eq!(chunk["choices"][0]["delta"]["content"], " Hi");
    }

    #[test]
    fn messages_events_become_completion_events() {
        let transform =
            stream_transform(ApiDialect::AnthropicText, ApiDialect::AnthropicChat).unwrap();
        let event: Value = serde_json::from_str(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hey"}}"#,
        )
        .unwrap();
        let out = transform(&event).unwrap().unwrap();
        assert_eq!(out["type"], "completion");
        assert_eq!(out["completion"], "Hey");
    }
}
