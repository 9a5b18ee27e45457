// src/keys/openai.rs

use crate::config::ServiceConfig;
use crate::error::Result;
use crate::keys::provider::KeyProvider;
use crate::keys::record::{BoundKey, KeyPatch, KeyView, Service, ServiceExtra};
use crate::keys::store::{KeyStore, StoreTuning};
use http::HeaderMap;
use secrecy::Secret;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// Families assumed for an unchecked key. The checker narrows or widens the
/// set from the upstream model listing.
const DEFAULT_FAMILIES: &[&str] = &["gpt-4", "gpt-3.5-turbo"];

/// USD per 1k output tokens, by family. Rough published list prices; only
/// used for the aggregate diagnostics string.
const PRICING_PER_1K: &[(&str, f64)] = &[
    ("gpt-4", 0.06),
    ("gpt-4-turbo", 0.03),
    ("gpt-3.5-turbo", 0.002),
];

/// Map an OpenAI model id to its capability family.
pub fn family_for_model(model: &str) -> Option<&'static str> {
    if model.starts_with("gpt-4-turbo") || model.starts_with("gpt-4-1106") {
        Some("gpt-4-turbo")
    } else if model.starts_with("gpt-4") {
        Some("gpt-4")
    } else if model.starts_with("gpt-3.5") {
        Some("gpt-3.5-turbo")
    } else if model.starts_with("text-embedding") {
        Some("embeddings")
    } else if model.starts_with("text-moderation") {
        Some("text-moderation")
    } else if model.starts_with("dall-e") {
        Some("image")
    } else if model.starts_with("whisper") || model.starts_with("tts") {
        Some("audio")
    } else if model.starts_with("text-") || model.ends_with("-instruct") {
        // Legacy completion models ride on the turbo tier.
        Some("gpt-3.5-turbo")
    } else {
        None
    }
}

pub struct OpenAiKeyProvider {
    store: KeyStore,
    base_url: String,
}

impl OpenAiKeyProvider {
    pub fn new(config: &ServiceConfig) -> Self {
        let tuning = StoreTuning {
            rate_limit_lockout: Duration::from_millis(config.rate_limit_lockout_ms),
            key_reuse_delay: Duration::from_millis(config.key_reuse_delay_ms),
            remaining_requests_floor: 1,
        };
        Self {
            store: KeyStore::new(Service::OpenAi, config.keys.clone(), DEFAULT_FAMILIES, tuning),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

impl KeyProvider for OpenAiKeyProvider {
    fn service(&self) -> Service {
        Service::OpenAi
    }

    fn list(&self) -> Vec<KeyView> {
        self.store.views()
    }

    fn get(&self, model: &str) -> Result<BoundKey> {
        self.store.select(&self.family_of(model))
    }

    fn disable(&self, hash: &str) {
        self.store.disable(hash);
    }

    fn update(&self, hash: &str, patch: KeyPatch) {
        self.store.update(hash, patch);
    }

    fn available(&self) -> usize {
        self.store.available()
    }

    fn any_unchecked(&self) -> bool {
        self.store.any_unchecked()
    }

    fn increment_prompt(&self, hash: &str) {
        self.store.increment_prompt(hash);
    }

    fn increment_usage(&self, hash: &str, model: &str, tokens: u64) {
        self.store.increment_usage(hash, &self.family_of(model), tokens);
    }

    fn mark_rate_limited(&self, hash: &str) {
        self.store.mark_rate_limited(hash);
    }

    fn get_lockout_period(&self, model: &str) -> Duration {
        self.store.lockout_period(&self.family_of(model))
    }

    fn remaining_quota(&self) -> f64 {
        self.store.remaining_quota()
    }

    fn usage_in_usd(&self) -> String {
        let usd = self.store.fold(0.0_f64, |acc, record| {
            acc + record
                .token_counts
                .iter()
                .map(|(family, tokens)| {
                    let rate = PRICING_PER_1K
                        .iter()
                        .find(|(f, _)| f == family)
                        .map_or(0.0, |(_, rate)| *rate);
                    (*tokens as f64 / 1000.0) * rate
                })
                .sum::<f64>()
        });
        format!("${usd:.2}")
    }

    fn update_rate_limits(&self, hash: &str, headers: &HeaderMap) {
        let remaining_requests = header_u64(headers, "x-ratelimit-remaining-requests");
        let remaining_tokens = header_u64(headers, "x-ratelimit-remaining-tokens");
        let reset_requests = header_string(headers, "x-ratelimit-reset-requests");
        let reset_tokens = header_string(headers, "x-ratelimit-reset-tokens");
        if remaining_requests.is_none() && remaining_tokens.is_none() {
            return;
        }
        self.store.with_record(hash, |record| {
            if let ServiceExtra::OpenAi {
                remaining_requests: rr,
                remaining_tokens: rt,
                reset_requests: resr,
                reset_tokens: rest,
            } = &mut record.extra
            {
                if remaining_requests.is_some() {
                    *rr = remaining_requests;
                }
                if remaining_tokens.is_some() {
                    *rt = remaining_tokens;
                }
                if reset_requests.is_some() {
                    *resr = reset_requests;
                }
                if reset_tokens.is_some() {
                    *rest = reset_tokens;
                }
            }
        });
        debug!(
            key.hash = %hash,
            remaining_requests = ?remaining_requests,
            remaining_tokens = ?remaining_tokens,
            "Stored OpenAI rate-limit headers"
        );
    }

    fn family_of(&self, model: &str) -> String {
        family_for_model(model).unwrap_or("gpt-3.5-turbo").to_string()
    }

    fn default_families(&self) -> Vec<String> {
        DEFAULT_FAMILIES.iter().map(|f| f.to_string()).collect()
    }

    fn checkable_keys(&self) -> Vec<(String, Secret<String>)> {
        self.store.checkable()
    }

    fn change_notifier(&self) -> Arc<Notify> {
        self.store.change_notifier()
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }
}
