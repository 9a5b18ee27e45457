// src/keys/checker.rs

use crate::keys::provider::KeyProvider;
use crate::keys::record::{AnthropicTier, KeyPatch, Service};
use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, Secret};
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Wire-format version header required by the Anthropic API.
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Scan cadence. Unchecked keys are retried on every scan; healthy keys are
/// re-probed once their last check is older than `HEALTHY_RECHECK`.
const SCAN_INTERVAL: Duration = Duration::from_secs(60);
const HEALTHY_RECHECK: Duration = Duration::from_secs(8 * 60 * 60);

/// Attempts per probe before deferring to the next scan.
const TRANSIENT_ATTEMPTS: u32 = 3;

#[derive(Debug)]
pub enum ProbeOutcome {
    /// Credential accepted; patch carries detected capabilities.
    Ok(KeyPatch),
    /// Upstream rejected the credential outright (401/403 non-billing).
    Revoked,
    /// Terminal billing failure.
    QuotaExhausted,
    /// 5xx or transport error; retried with backoff, never disables alone.
    Transient(String),
}

/// A cheap authenticated request against one upstream family.
#[async_trait]
pub trait KeyProbe: Send + Sync {
    async fn probe(&self, client: &Client, key: &Secret<String>) -> ProbeOutcome;
}

pub struct OpenAiProbe {
    base_url: String,
}

#[async_trait]
impl KeyProbe for OpenAiProbe {
    async fn probe(&self, client: &Client, key: &Secret<String>) -> ProbeOutcome {
        let url = format!("{}/v1/models", self.base_url.trim_end_matches('/'));
        let response = match client
            .get(&url)
            .bearer_auth(key.expose_secret())
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return ProbeOutcome::Transient(e.to_string()),
        };
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::OK => {
                let mut families: BTreeSet<String> = BTreeSet::new();
                if let Ok(listing) = serde_json::from_str::<serde_json::Value>(&body) {
                    if let Some(models) = listing.get("data").and_then(|d| d.as_array()) {
                        for model in models {
                            if let Some(id) = model.get("id").and_then(|i| i.as_str()) {
                                if let Some(family) = crate::keys::openai::family_for_model(id) {
                                    families.insert(family.to_string());
                                }
                            }
                        }
                    }
                }
                if families.is_empty() {
                    families.insert("gpt-3.5-turbo".to_string());
                }
                ProbeOutcome::Ok(KeyPatch::families(families))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProbeOutcome::Revoked,
            StatusCode::TOO_MANY_REQUESTS => {
                if body.contains("insufficient_quota") {
                    ProbeOutcome::QuotaExhausted
                } else {
                    // Busy key is still a valid key.
                    ProbeOutcome::Ok(KeyPatch::default())
                }
            }
            s if s.is_server_error() => ProbeOutcome::Transient(format!("status {s}")),
            s => ProbeOutcome::Transient(format!("unexpected status {s}")),
        }
    }
}

pub struct AnthropicProbe {
    base_url: String,
}

#[async_trait]
impl KeyProbe for AnthropicProbe {
    async fn probe(&self, client: &Client, key: &Secret<String>) -> ProbeOutcome {
        // Anthropic exposes no listing endpoint; the cheapest authenticated
        // request is a 1-token message.
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let probe_body = json!({
            "model": "claude-3-haiku-20240307",
            "max_tokens": 1,
            "messages": [{"role": "user", "content": "ping"}],
        });
        let response = match client
            .post(&url)
            .header("x-api-key", key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&probe_body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return ProbeOutcome::Transient(e.to_string()),
        };
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::OK => {
                let mut patch = KeyPatch::families(
                    ["claude".to_string(), "claude-opus".to_string()],
                );
                patch.tier = Some(AnthropicTier::Paid);
                ProbeOutcome::Ok(patch)
            }
            // A schema complaint still proves the credential works.
            StatusCode::BAD_REQUEST => ProbeOutcome::Ok(KeyPatch::default()),
            StatusCode::UNAUTHORIZED => ProbeOutcome::Revoked,
            StatusCode::FORBIDDEN => {
                if is_billing_failure(&body) {
                    ProbeOutcome::QuotaExhausted
                } else {
                    ProbeOutcome::Revoked
                }
            }
            StatusCode::TOO_MANY_REQUESTS => {
                // Tight limits on a 1-token probe point at a trial key.
                let mut patch = KeyPatch::default();
                patch.tier = Some(AnthropicTier::Trial);
                ProbeOutcome::Ok(patch)
            }
            s if s.is_server_error() => ProbeOutcome::Transient(format!("status {s}")),
            s => ProbeOutcome::Transient(format!("unexpected status {s}")),
        }
    }
}

pub struct GoogleProbe {
    base_url: String,
}

#[async_trait]
impl KeyProbe for GoogleProbe {
    async fn probe(&self, client: &Client, key: &Secret<String>) -> ProbeOutcome {
        let url = format!(
            "{}/v1beta/models?key={}",
            self.base_url.trim_end_matches('/'),
            key.expose_secret()
        );
        let response = match client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => return ProbeOutcome::Transient(e.to_string()),
        };
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::OK => {
                let mut families: BTreeSet<String> = BTreeSet::new();
                let mut model_ids = Vec::new();
                if let Ok(listing) = serde_json::from_str::<serde_json::Value>(&body) {
                    if let Some(models) = listing.get("models").and_then(|m| m.as_array()) {
                        for model in models {
                            if let Some(name) = model.get("name").and_then(|n| n.as_str()) {
                                model_ids.push(name.to_string());
                                let id = name.strip_prefix("models/").unwrap_or(name);
                                if let Some(family) = crate::keys::google::family_for_model(id) {
                                    families.insert(family.to_string());
                                }
                            }
                        }
                    }
                }
                if families.is_empty() {
                    families.insert("gemini-pro".to_string());
                }
                let mut patch = KeyPatch::families(families);
                patch.model_ids = Some(model_ids);
                ProbeOutcome::Ok(patch)
            }
            StatusCode::BAD_REQUEST if body.contains("API_KEY_INVALID") => ProbeOutcome::Revoked,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProbeOutcome::Revoked,
            StatusCode::TOO_MANY_REQUESTS => ProbeOutcome::Ok(KeyPatch::default()),
            s if s.is_server_error() => ProbeOutcome::Transient(format!("status {s}")),
            s => ProbeOutcome::Transient(format!("unexpected status {s}")),
        }
    }
}

/// Detect Anthropic billing-flavoured 403 bodies.
pub fn is_billing_failure(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("billing") || lower.contains("credit balance") || lower.contains("purchase")
}

fn probe_for(provider: &Arc<dyn KeyProvider>) -> Box<dyn KeyProbe> {
    let base_url = provider.base_url().to_string();
    match provider.service() {
        Service::OpenAi => Box::new(OpenAiProbe { base_url }),
        Service::Anthropic => Box::new(AnthropicProbe { base_url }),
        Service::GoogleAi => Box::new(GoogleProbe { base_url }),
    }
}

/// Per-provider background task probing each key on a cadence and feeding
/// findings back through the provider's `update` path, which is the sole
/// writer. Findings are in-memory only.
pub struct KeyChecker {
    provider: Arc<dyn KeyProvider>,
    probe: Box<dyn KeyProbe>,
    client: Client,
}

impl KeyChecker {
    pub fn new(provider: Arc<dyn KeyProvider>) -> Self {
        let probe = probe_for(&provider);
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            provider,
            probe,
            client,
        }
    }

    /// Spawn the checker loop.
    pub fn start(self) -> JoinHandle<()> {
        info!(service = %self.provider.service(), "Starting key checker");
        tokio::spawn(async move {
            loop {
                self.scan().await;
                tokio::time::sleep(SCAN_INTERVAL).await;
            }
        })
    }

    /// One pass over the provider's keys, probing those that are due.
    async fn scan(&self) {
        let secrets: HashMap<String, Secret<String>> =
            self.provider.checkable_keys().into_iter().collect();
        let views = self.provider.list();

        for view in views {
            if view.is_disabled {
                continue;
            }
            let due = match view.last_checked_ms_ago {
                None => true,
                Some(age_ms) => Duration::from_millis(age_ms) >= HEALTHY_RECHECK,
            };
            if !due {
                continue;
            }
            let Some(secret) = secrets.get(&view.hash) else {
                continue;
            };
            self.check_key(&view.hash, secret).await;
            // Spread probes out so a long key list does not burst upstream.
            let jitter = rand::thread_rng().gen_range(100..400);
            tokio::time::sleep(Duration::from_millis(jitter)).await;
        }
    }

    async fn check_key(&self, hash: &str, secret: &Secret<String>) {
        let mut backoff = Duration::from_secs(1);
        for attempt in 1..=TRANSIENT_ATTEMPTS {
            match self.probe.probe(&self.client, secret).await {
                ProbeOutcome::Ok(patch) => {
                    debug!(service = %self.provider.service(), key.hash = %hash, "Key probe ok");
                    self.provider.update(hash, patch);
                    return;
                }
                ProbeOutcome::Revoked => {
                    warn!(
                        service = %self.provider.service(),
                        key.hash = %hash,
                        "Key probe: credential rejected, revoking"
                    );
                    self.provider.update(hash, KeyPatch::revoke());
                    return;
                }
                ProbeOutcome::QuotaExhausted => {
                    warn!(
                        service = %self.provider.service(),
                        key.hash = %hash,
                        "Key probe: quota exhausted, revoking"
                    );
                    self.provider.update(hash, KeyPatch::revoke());
                    return;
                }
                ProbeOutcome::Transient(reason) => {
                    debug!(
                        service = %self.provider.service(),
                        key.hash = %hash,
                        attempt,
                        reason = %reason,
                        "Key probe transient failure"
                    );
                    if attempt < TRANSIENT_ATTEMPTS {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }
        // Exhausted transient retries: leave the key untouched and let the
        // next scan try again.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn billing_detection_matches_known_phrasings() {
        assert!(is_billing_failure(
            r#"{"error":{"type":"forbidden","message":"Your credit balance is too low"}}"#
        ));
        assert!(is_billing_failure("billing suspended"));
        assert!(!is_billing_failure("invalid x-api-key"));
    }
}
