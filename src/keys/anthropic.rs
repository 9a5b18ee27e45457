// src/keys/anthropic.rs

use crate::config::ServiceConfig;
use crate::error::Result;
use crate::keys::provider::KeyProvider;
use crate::keys::record::{BoundKey, KeyPatch, KeyView, Service};
use crate::keys::store::{KeyStore, StoreTuning};
use secrecy::Secret;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

const DEFAULT_FAMILIES: &[&str] = &["claude", "claude-opus"];

/// USD per 1k output tokens. Opus is the expensive tier; everything else is
/// lumped under the base rate for the diagnostics string.
const PRICING_PER_1K: &[(&str, f64)] = &[("claude", 0.024), ("claude-opus", 0.075)];

pub fn family_for_model(model: &str) -> Option<&'static str> {
    if !model.starts_with("claude") {
        return None;
    }
    if model.contains("opus") {
        Some("claude-opus")
    } else {
        Some("claude")
    }
}

/// Anthropic provider. No response headers are trusted for rate-limit hints;
/// the only pacing feedback is 429s, so `update_rate_limits` stays the
/// trait's no-op.
pub struct AnthropicKeyProvider {
    store: KeyStore,
    base_url: String,
}

impl AnthropicKeyProvider {
    pub fn new(config: &ServiceConfig) -> Self {
        let tuning = StoreTuning {
            rate_limit_lockout: Duration::from_millis(config.rate_limit_lockout_ms),
            key_reuse_delay: Duration::from_millis(config.key_reuse_delay_ms),
            remaining_requests_floor: 0,
        };
        Self {
            store: KeyStore::new(
                Service::Anthropic,
                config.keys.clone(),
                DEFAULT_FAMILIES,
                tuning,
            ),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }
}

impl KeyProvider for AnthropicKeyProvider {
    fn service(&self) -> Service {
        Service::Anthropic
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

    fn family_of(&self, model: &str) -> String {
        family_for_model(model).unwrap_or("claude").to_string()
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
