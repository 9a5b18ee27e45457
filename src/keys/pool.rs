// src/keys/pool.rs

use crate::config::AppConfig;
use crate::error::{AppError, Result};
use crate::keys::anthropic::AnthropicKeyProvider;
use crate::keys::google::GoogleKeyProvider;
use crate::keys::openai::OpenAiKeyProvider;
use crate::keys::provider::KeyProvider;
use crate::keys::record::{BoundKey, KeyPatch, KeyView, Service};
use http::HeaderMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Built-in model-prefix routing. Configured `route_prefixes` are consulted
/// first, so deployments can claim new model names without a rebuild.
const DEFAULT_PREFIXES: &[(&str, Service)] = &[
    ("gpt-", Service::OpenAi),
    ("dall-e", Service::OpenAi),
    ("text-", Service::OpenAi),
    ("whisper", Service::OpenAi),
    ("tts-", Service::OpenAi),
    ("claude", Service::Anthropic),
    ("gemini", Service::GoogleAi),
];

/// Routes pool operations to the provider owning the request's target
/// service. Never introspects concrete provider types: every per-service
/// behaviour lives behind the `KeyProvider` trait.
pub struct KeyPool {
    providers: Vec<Arc<dyn KeyProvider>>,
    prefixes: Vec<(String, Service)>,
}

impl KeyPool {
    pub fn new(config: &AppConfig) -> Self {
        let mut providers: Vec<Arc<dyn KeyProvider>> = Vec::new();
        if !config.services.openai.keys.is_empty() {
            providers.push(Arc::new(OpenAiKeyProvider::new(&config.services.openai)));
        }
        if !config.services.anthropic.keys.is_empty() {
            providers.push(Arc::new(AnthropicKeyProvider::new(
                &config.services.anthropic,
            )));
        }
        if !config.services.google_ai.keys.is_empty() {
            providers.push(Arc::new(GoogleKeyProvider::new(&config.services.google_ai)));
        }
        info!(
            services = ?providers.iter().map(|p| p.service()).collect::<Vec<_>>(),
            "Key pool initialized"
        );

        let mut prefixes: Vec<(String, Service)> = config
            .route_prefixes
            .iter()
            .filter_map(|r| Service::parse(&r.service).map(|s| (r.prefix.clone(), s)))
            .collect();
        prefixes.extend(
            DEFAULT_PREFIXES
                .iter()
                .map(|(p, s)| (p.to_string(), *s)),
        );

        Self { providers, prefixes }
    }

    pub fn services(&self) -> Vec<Service> {
        self.providers.iter().map(|p| p.service()).collect()
    }

    pub fn provider(&self, service: Service) -> Option<&Arc<dyn KeyProvider>> {
        self.providers.iter().find(|p| p.service() == service)
    }

    fn provider_or_err(&self, service: Service) -> Result<&Arc<dyn KeyProvider>> {
        self.provider(service).ok_or_else(|| AppError::NoKeysAvailable {
            service: service.to_string(),
        })
    }

    /// Infer the target service from a model name via the prefix table.
    pub fn service_for_model(&self, model: &str) -> Result<Service> {
        self.prefixes
            .iter()
            .find(|(prefix, _)| model.starts_with(prefix.as_str()))
            .map(|(_, service)| *service)
            .ok_or_else(|| {
                AppError::bad_request(format!("cannot infer target service for model '{model}'"))
            })
    }

    /// Select a key for `model`, routing by the inferred service.
    pub fn get(&self, model: &str) -> Result<BoundKey> {
        let service = self.service_for_model(model)?;
        self.provider_or_err(service)?.get(model)
    }

    pub fn disable(&self, key: &BoundKey) {
        if let Some(provider) = self.provider(key.service) {
            provider.disable(&key.hash);
        }
    }

    pub fn mark_rate_limited(&self, key: &BoundKey) {
        if let Some(provider) = self.provider(key.service) {
            provider.mark_rate_limited(&key.hash);
            crate::metrics::METRICS.key_lockouts_total.increment(1);
        }
    }

    pub fn revoke(&self, key: &BoundKey) {
        if let Some(provider) = self.provider(key.service) {
            provider.update(&key.hash, KeyPatch::revoke());
            crate::metrics::METRICS.key_revocations_total.increment(1);
        }
    }

    pub fn increment_prompt(&self, key: &BoundKey) {
        if let Some(provider) = self.provider(key.service) {
            provider.increment_prompt(&key.hash);
        }
    }

    pub fn increment_usage(&self, key: &BoundKey, model: &str, tokens: u64) {
        if let Some(provider) = self.provider(key.service) {
            provider.increment_usage(&key.hash, model, tokens);
        }
    }

    /// Delegated to every provider; those without header hints no-op.
    pub fn update_rate_limits(&self, key: &BoundKey, headers: &HeaderMap) {
        if let Some(provider) = self.provider(key.service) {
            provider.update_rate_limits(&key.hash, headers);
        }
    }

    /// Per-service count of non-disabled keys.
    pub fn available(&self, service: Service) -> usize {
        self.provider(service).map_or(0, |p| p.available())
    }

    pub fn any_unchecked(&self, service: Service) -> bool {
        self.provider(service).is_some_and(|p| p.any_unchecked())
    }

    pub fn get_lockout_period(&self, service: Service, model: &str) -> Duration {
        self.provider(service)
            .map_or(Duration::ZERO, |p| p.get_lockout_period(model))
    }

    /// Redacted views of every key across all providers.
    pub fn list(&self) -> Vec<KeyView> {
        self.providers.iter().flat_map(|p| p.list()).collect()
    }
}
