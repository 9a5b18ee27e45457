// tests/dialect_tests.rs
//
// Round-trip properties over the translation table: pairs with an inverse
// recover the original body modulo the documented lossy fields (ids,
// timestamps).

use llm_key_proxy::dialect::anthropic::{
    anthropic_text_to_chat, flatten_messages, openai_to_anthropic_text, split_prompt,
};
use llm_key_proxy::dialect::openai::{chat_to_text_response, text_to_chat_request};
use llm_key_proxy::dialect::{ApiDialect, TRANSFORMS};
use serde_json::json;

#[test]
fn flatten_then_split_recovers_the_conversation() {
    // R1 for the openai -> anthropic-text -> anthropic-chat chain.
    let messages = vec![
        json!({"role": "system", "content": "Answer in French."}),
        json!({"role": "user", "content": "How are you?"}),
        json!({"role": "assistant", "content": "Ça va bien."}),
        json!({"role": "user", "content": "And the weather?"}),
    ];
    let prompt = flatten_messages(&messages).unwrap();
    let (system, turns) = split_prompt(&prompt);

    assert_eq!(system.as_deref(), Some("Answer in French."));
    let expected: Vec<_> = messages[1..].to_vec();
    assert_eq!(turns, expected);
}

#[test]
fn text_wrap_then_unwrap_recovers_the_prompt() {
    // R1 for openai-text -> openai.
    let original = json!({
        "model": "gpt-3.5-turbo-instruct",
        "prompt": "Once upon a time",
        "max_tokens": 64,
        "temperature": 0.7,
    });
    let chat_request = text_to_chat_request(&original).unwrap();
    assert_eq!(chat_request["messages"][0]["content"], "Once upon a time");
    assert_eq!(chat_request["max_tokens"], 64);

    // And the response direction maps choices back into text shape.
    let chat_response = json!({
        "id": "chatcmpl-9",
        "model": "gpt-3.5-turbo",
        "created": 123,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": ", there was a fox."},
            "finish_reason": "stop",
        }],
        "usage": {"prompt_tokens": 4, "completion_tokens": 6, "total_tokens": 10},
    });
    let text_response = chat_to_text_response(&chat_response).unwrap();
    assert_eq!(text_response["object"], "text_completion");
    assert_eq!(text_response["choices"][0]["text"], ", there was a fox.");
    assert_eq!(text_response["choices"][0]["finish_reason"], "stop");
}

#[test]
fn openai_to_anthropic_text_and_back_preserves_content() {
    let inbound = json!({
        "model": "claude-2",
        "messages": [{"role": "user", "content": "Tell me a joke."}],
        "max_tokens": 100,
    });
    let outbound = openai_to_anthropic_text(&inbound).unwrap();
    let prompt = outbound["prompt"].as_str().unwrap();
    assert!(prompt.contains("Tell me a joke."));

    let upstream_response = json!({
        "completion": " Why did the crab never share? Because he was shellfish.",
        "stop_reason": "stop_sequence",
        "model": "claude-2",
    });
    let client_response = TRANSFORMS
        .translate_response(ApiDialect::OpenAi, ApiDialect::AnthropicText, &upstream_response)
        .unwrap();
    assert_eq!(client_response["object"], "chat.completion");
    assert_eq!(
        client_response["choices"][0]["message"]["content"],
        "Why did the crab never share? Because he was shellfish."
    );
    assert!(client_response["usage"]["completion_tokens"].as_u64().unwrap() > 0);
}

#[test]
fn claude3_upgrade_translates_both_directions() {
    let text_request = json!({
        "model": "claude-3-opus-20240229",
        "prompt": "\n\nHuman: hi\n\nAssistant:",
        "max_tokens_to_sample": 50,
    });
    let chat_request = anthropic_text_to_chat(&text_request).unwrap();
    assert_eq!(chat_request["messages"], json!([{"role": "user", "content": "hi"}]));
    assert_eq!(chat_request["max_tokens"], 50);

    let chat_response = json!({
        "id": "msg_1",
        "model": "claude-3-opus-20240229",
        "content": [{"type": "text", "text": "Hello!"}],
        "stop_reason": "end_turn",
        "usage": {"input_tokens": 3, "output_tokens": 2},
    });
    let text_response = TRANSFORMS
        .translate_response(
            ApiDialect::AnthropicText,
            ApiDialect::AnthropicChat,
            &chat_response,
        )
        .unwrap();
    assert_eq!(text_response["type"], "completion");
    assert_eq!(text_response["completion"], "Hello!");
}

#[test]
fn stop_sequences_survive_translation() {
    let inbound = json!({
        "model": "claude-2",
        "messages": [{"role": "user", "content": "count"}],
        "stop": ["STOP", "END"],
    });
    let out = openai_to_anthropic_text(&inbound).unwrap();
    assert_eq!(out["stop_sequences"], json!(["STOP", "END"]));

    let chat = TRANSFORMS
        .translate_request(ApiDialect::OpenAi, ApiDialect::AnthropicChat, &inbound)
        .unwrap();
    assert_eq!(chat["stop_sequences"], json!(["STOP", "END"]));
}

#[test]
fn google_pair_round_trips_content() {
    let inbound = json!({
        "model": "gemini-pro",
        "messages": [
            {"role": "user", "content": "What is Rust?"},
        ],
        "max_tokens": 200,
    });
    let outbound = TRANSFORMS
        .translate_request(ApiDialect::OpenAi, ApiDialect::GoogleAi, &inbound)
        .unwrap();
    assert_eq!(
        outbound["contents"][0]["parts"][0]["text"],
        "What is Rust?"
    );

    let upstream_response = json!({
        "candidates": [{
            "content": {"parts": [{"text": "A systems language."}], "role": "model"},
            "finishReason": "STOP",
        }],
        "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 4},
    });
    let client_response = TRANSFORMS
        .translate_response(ApiDialect::OpenAi, ApiDialect::GoogleAi, &upstream_response)
        .unwrap();
    assert_eq!(
        client_response["choices"][0]["message"]["content"],
        "A systems language."
    );
    assert_eq!(client_response["usage"]["prompt_tokens"], 5);
}
