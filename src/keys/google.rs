// src/keys/google.rs

use crate::config::ServiceConfig;
use crate::error::Result;
use crate::keys::provider::KeyProvider;
use crate::keys::record::{BoundKey, KeyPatch, KeyView, Service};
use crate::keys::store::{KeyStore, StoreTuning};
use secrecy::Secret;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

const DEFAULT_FAMILIES: &[&str] = &["gemini-pro", "gemini-flash"];

pub fn family_for_model(model: &str) -> Option<&'static str> {
    if !model.starts_with("gemini") {
        return None;
    }
    if model.contains("ultra") {
        Some("gemini-ultra")
    } else if model.contains("flash") {
        Some("gemini-flash")
    } else {
        Some("gemini-pro")
    }
}

pub struct GoogleKeyProvider {
    store: KeyStore,
    base_url: String,
}

impl GoogleKeyProvider {
    pub fn new(config: &ServiceConfig) -> Self {
        let tuning = StoreTuning {
            rate_limit_lockout: Duration::from_millis(config.rate_limit_lockout_ms),
            key_reuse_delay: Duration::from_millis(config.key_reuse_delay_ms),
            remaining_requests_floor: 0,
        };
        Self {
            store: KeyStore::new(
                Service::GoogleAi,
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

impl KeyProvider for GoogleKeyProvider {
    fn service(&self) -> Service {
        Service::GoogleAi
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
        // No public per-token pricing worth tracking for the diagnostic
        // string; report volume instead.
        let tokens = self.store.fold(0u64, |acc, r| acc + r.total_tokens());
        format!("{tokens} tokens")
    }

    fn family_of(&self, model: &str) -> String {
        family_for_model(model).unwrap_or("gemini-pro").to_string()
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemini_family_mapping() {
        assert_eq!(family_for_model("gemini-pro"), Some("gemini-pro"));
        assert_eq!(family_for_model("gemini-1.5-flash"), Some("gemini-flash"));
        assert_eq!(family_for_model("gemini-ultra"), Some("gemini-ultra"));
        assert_eq!(family_for_model("claude-2"), None);
    }

    #[test]
    fn checker_model_ids_are_recorded() {
        let p = GoogleKeyProvider::new(&ServiceConfig {
            keys: vec!["AIza-test".to_string()],
            ..ServiceConfig::default()
        });
        let hash = p.list()[0].hash.clone();
        p.update(
            &hash,
            KeyPatch {
                model_ids: Some(vec!["models/gemini-pro".to_string()]),
                model_families: Some(["gemini-pro".to_string()].into_iter().collect()),
                ..KeyPatch::default()
            },
        );
        assert!(p.get("gemini-pro").is_ok());
        assert!(p.get("gemini-ultra").is_err());
    }
}
