// src/tokenizer.rs
//
// Heuristic token estimation. The pipeline consults this as an oracle for
// queue accounting and synthesised usage blocks; exact counts come from
// upstream usage fields when present.

use crate::dialect::ApiDialect;
use serde_json::Value;

/// Rough characters-per-token ratio for GPT-style BPE vocabularies.
const OPENAI_CHARS_PER_TOKEN: f64 = 4.0;

/// Claude's vocabulary runs slightly denser on English prose.
const ANTHROPIC_CHARS_PER_TOKEN: f64 = 3.5;

/// Per-message framing overhead in chat transcripts.
const MESSAGE_OVERHEAD_TOKENS: usize = 4;

fn estimate(text: &str, chars_per_token: f64) -> usize {
    if text.is_empty() {
        return 0;
    }
    let by_chars = (text.chars().count() as f64 / chars_per_token).ceil() as usize;
    // Whitespace-separated words put a floor under pathological inputs like
    // long runs of single-character words.
    let by_words = text.split_whitespace().count();
    by_chars.max(by_words)
}

pub fn estimate_tokens_openai(text: &str) -> usize {
    estimate(text, OPENAI_CHARS_PER_TOKEN)
}

pub fn estimate_tokens_anthropic(text: &str) -> usize {
    estimate(text, ANTHROPIC_CHARS_PER_TOKEN)
}

/// Estimate the prompt cost of a validated inbound body.
pub fn estimate_prompt_tokens(dialect: ApiDialect, body: &Value) -> usize {
    let chars_per_token = match dialect {
        ApiDialect::AnthropicText | ApiDialect::AnthropicChat => ANTHROPIC_CHARS_PER_TOKEN,
        _ => OPENAI_CHARS_PER_TOKEN,
    };

    if let Some(messages) = body.get("messages").and_then(Value::as_array) {
        return messages
            .iter()
            .filter_map(|m| m.get("content").and_then(Value::as_str))
            .map(|content| estimate(content, chars_per_token) + MESSAGE_OVERHEAD_TOKENS)
            .sum();
    }
    if let Some(prompt) = body.get("prompt").and_then(Value::as_str) {
        return estimate(prompt, chars_per_token);
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_text_costs_nothing() {
        assert_eq!(estimate_tokens_openai(""), 0);
    }

    #[test]
    fn prose_estimate_tracks_length() {
        let short = estimate_tokens_openai("hello world");
        let long = estimate_tokens_openai(&"hello world ".repeat(100));
        assert!(short >= 2);
        assert!(long > short * 50);
    }

    #[test]
    fn chat_bodies_count_every_message() {
        let body = json!({
            "messages": [
                {"role": "user", "content": "first question here"},
                {"role": "assistant", "content": "an answer"},
            ],
        });
        let cost = estimate_prompt_tokens(ApiDialect::OpenAi, &body);
        assert!(cost >= 2 * MESSAGE_OVERHEAD_TOKENS);
    }

    #[test]
    fn text_bodies_use_the_prompt_field() {
        let body = json!({"prompt": "\n\nHuman: hi\n\nAssistant:"});
        assert!(estimate_prompt_tokens(ApiDialect::AnthropicText, &body) > 0);
    }
}
