// src/dialect/mod.rs
//
// Body translation between API dialects. Every supported (inbound, outbound)
// pair is a pure function over `serde_json::Value`, registered once at
// startup; pairs missing from the table fail loudly at request entry.

pub mod anthropic;
pub mod google;
pub mod openai;
pub mod streaming;

use crate::error::{AppError, Result};
use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// The shape of request and response bodies expected by one API family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiDialect {
    OpenAi,
    OpenAiText,
    OpenAiImage,
    AnthropicText,
    AnthropicChat,
    GoogleAi,
}

impl ApiDialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::OpenAiText => "openai-text",
            Self::OpenAiImage => "openai-image",
            Self::AnthropicText => "anthropic-text",
            Self::AnthropicChat => "anthropic-chat",
            Self::GoogleAi => "google-ai",
        }
    }
}

impl fmt::Display for ApiDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type BodyTransform = fn(&Value) -> Result<Value>;

fn identity(body: &Value) -> Result<Value> {
    Ok(body.clone())
}

/// Request- and response-direction transforms, keyed by
/// `(inbound dialect, outbound dialect)`.
pub struct TransformTable {
    requests: HashMap<(ApiDialect, ApiDialect), BodyTransform>,
    responses: HashMap<(ApiDialect, ApiDialect), BodyTransform>,
}

impl TransformTable {
    fn new() -> Self {
        use ApiDialect::*;

        let mut requests: HashMap<(ApiDialect, ApiDialect), BodyTransform> = HashMap::new();
        let mut responses: HashMap<(ApiDialect, ApiDialect), BodyTransform> = HashMap::new();

        for dialect in [OpenAi, OpenAiText, OpenAiImage, AnthropicText, AnthropicChat] {
            requests.insert((dialect, dialect), identity);
            responses.insert((dialect, dialect), identity);
        }

        requests.insert((OpenAi, AnthropicText), anthropic::openai_to_anthropic_text);
        responses.insert(
            (OpenAi, AnthropicText),
            anthropic::completion_to_openai_chat,
        );

        requests.insert((OpenAi, AnthropicChat), anthropic::openai_to_anthropic_chat);
        responses.insert((OpenAi, AnthropicChat), anthropic::messages_to_openai_chat);

        requests.insert(
            (AnthropicText, AnthropicChat),
            anthropic::anthropic_text_to_chat,
        );
        responses.insert(
            (AnthropicText, AnthropicChat),
            anthropic::messages_to_completion,
        );

        requests.insert((OpenAiText, OpenAi), openai::text_to_chat_request);
        responses.insert((OpenAiText, OpenAi), openai::chat_to_text_response);

        requests.insert((OpenAi, GoogleAi), google::openai_to_google);
        responses.insert((OpenAi, GoogleAi), google::google_to_openai_chat);

        Self {
            requests,
            responses,
        }
    }

    /// Translate a validated inbound body into the outbound dialect.
    pub fn translate_request(
        &self,
        inbound: ApiDialect,
        outbound: ApiDialect,
        body: &Value,
    ) -> Result<Value> {
        let transform = self
            .requests
            .get(&(inbound, outbound))
            .ok_or_else(|| AppError::unsupported(inbound.as_str(), outbound.as_str()))?;
        transform(body)
    }

    /// Reshape an upstream response body back into the client's dialect.
    pub fn translate_response(
        &self,
        inbound: ApiDialect,
        outbound: ApiDialect,
        body: &Value,
    ) -> Result<Value> {
        let transform = self
            .responses
            .get(&(inbound, outbound))
            .ok_or_else(|| AppError::unsupported(inbound.as_str(), outbound.as_str()))?;
        transform(body)
    }

    pub fn supports(&self, inbound: ApiDialect, outbound: ApiDialect) -> bool {
        self.requests.contains_key(&(inbound, outbound))
    }
}

/// The process-wide transform table.
pub static TRANSFORMS: Lazy<TransformTable> = Lazy::new(TransformTable::new);

/// Validate an inbound body against its dialect's schema.
///
/// # Errors
///
/// `BadRequest` naming the first violated field.
pub fn validate(dialect: ApiDialect, body: &Value) -> Result<()> {
    match dialect {
        ApiDialect::OpenAi => openai::validate_chat(body),
        ApiDialect::OpenAiText => openai::validate_text(body),
        ApiDialect::OpenAiImage => openai::validate_image(body),
        ApiDialect::AnthropicText => anthropic::validate_text(body),
        ApiDialect::AnthropicChat => anthropic::validate_chat(body),
        ApiDialect::GoogleAi => Err(AppError::bad_request(
            "google-ai is not an accepted inbound dialect",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_pairs_fail_loudly() {
        let body = json!({"model": "dall-e-3", "prompt": "a fox"});
        let err = TRANSFORMS
            .translate_request(ApiDialect::OpenAiImage, ApiDialect::AnthropicChat, &body)
            .unwrap_err();
        assert!(matches!(err, AppError::Unsupported { .. }));
    }

    #[test]
    fn identity_pairs_are_registered() {
        assert!(TRANSFORMS.supports(ApiDialect::OpenAi, ApiDialect::OpenAi));
        assert!(TRANSFORMS.supports(ApiDialect::AnthropicChat, ApiDialect::AnthropicChat));
    }

    #[test]
    fn identity_translation_preserves_body() {
        let body = json!({"model": "gpt-4", "messages": [{"role": "user", "content": "hi"}]});
        let out = TRANSFORMS
            .translate_request(ApiDialect::OpenAi, ApiDialect::OpenAi, &body)
            .unwrap();
        assert_eq!(out, body);
    }
}
