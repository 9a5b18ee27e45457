// src/keys/record.rs

use secrecy::{ExposeSecret, Secret};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::Instant;

/// Upstream API family a credential belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Service {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "google-ai")]
    GoogleAi,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::GoogleAi => "google-ai",
        }
    }

    /// Short tag used as the key-hash prefix.
    fn hash_prefix(&self) -> &'static str {
        match self {
            Self::OpenAi => "oai",
            Self::Anthropic => "ant",
            Self::GoogleAi => "goo",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "openai" => Some(Self::OpenAi),
            "anthropic" => Some(Self::Anthropic),
            "google-ai" => Some(Self::GoogleAi),
            _ => None,
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anthropic accounts come in two flavours with very different limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AnthropicTier {
    Trial,
    Paid,
}

/// Service-specific mutable extensions of a key record.
#[derive(Debug, Clone)]
pub enum ServiceExtra {
    OpenAi {
        /// Harvested from `x-ratelimit-remaining-requests`.
        remaining_requests: Option<u64>,
        /// Harvested from `x-ratelimit-remaining-tokens`.
        remaining_tokens: Option<u64>,
        /// Harvested reset hints, kept verbatim for diagnostics.
        reset_requests: Option<String>,
        reset_tokens: Option<String>,
    },
    Anthropic {
        tier: Option<AnthropicTier>,
    },
    GoogleAi {
        /// Raw upstream model list from the checker, for diagnostic display.
        model_ids: Vec<String>,
    },
}

impl ServiceExtra {
    pub fn new(service: Service) -> Self {
        match service {
            Service::OpenAi => Self::OpenAi {
                remaining_requests: None,
                remaining_tokens: None,
                reset_requests: None,
                reset_tokens: None,
            },
            Service::Anthropic => Self::Anthropic { tier: None },
            Service::GoogleAi => Self::GoogleAi {
                model_ids: Vec::new(),
            },
        }
    }
}

/// Compute the public fingerprint of a secret: service tag plus the first
/// eight hex characters of the SHA-256 digest.
pub fn fingerprint(service: Service, secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    let hex: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();
    format!("{}-{}", service.hash_prefix(), hex)
}

/// Per-credential state. Owned exclusively by a key provider; all external
/// callers address records by `hash`.
#[derive(Debug, Clone)]
pub struct KeyRecord {
    pub key: Secret<String>,
    pub hash: String,
    pub service: Service,

    pub is_disabled: bool,
    pub is_revoked: bool,
    /// Capability tags (e.g. "gpt-4", "claude-opus"). A key with an empty
    /// set is never selectable.
    pub model_families: BTreeSet<String>,

    pub last_used: Option<Instant>,
    pub last_checked: Option<Instant>,
    pub prompt_count: u64,
    pub rate_limited_at: Option<Instant>,
    pub rate_limited_until: Option<Instant>,
    /// Output tokens attributed per model family.
    pub token_counts: HashMap<String, u64>,

    pub extra: ServiceExtra,
}

impl KeyRecord {
    pub fn new(service: Service, secret: String, default_families: &[&str]) -> Self {
        let hash = fingerprint(service, &secret);
        Self {
            key: Secret::new(secret),
            hash,
            service,
            is_disabled: false,
            is_revoked: false,
            model_families: default_families.iter().map(|f| f.to_string()).collect(),
            last_used: None,
            last_checked: None,
            prompt_count: 0,
            rate_limited_at: None,
            rate_limited_until: None,
            token_counts: HashMap::new(),
            extra: ServiceExtra::new(service),
        }
    }

    /// Redacted preview of the secret for log lines.
    pub fn preview(&self) -> String {
        let value = self.key.expose_secret();
        if value.len() > 8 {
            format!("{}...{}", &value[..4], &value[value.len() - 4..])
        } else {
            "...".to_string()
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.token_counts.values().sum()
    }
}

/// Public, secret-free view of a key record.
#[derive(Debug, Clone, Serialize)]
pub struct KeyView {
    pub hash: String,
    pub service: Service,
    pub is_disabled: bool,
    pub is_revoked: bool,
    pub model_families: BTreeSet<String>,
    pub prompt_count: u64,
    pub total_tokens: u64,
    /// Milliseconds since the key was last dispatched, if ever.
    pub last_used_ms_ago: Option<u64>,
    /// Milliseconds since the checker last probed the key, if ever.
    pub last_checked_ms_ago: Option<u64>,
    /// Milliseconds until the current lockout clears, if armed.
    pub rate_limited_for_ms: Option<u64>,
}

impl KeyView {
    pub fn of(record: &KeyRecord, now: Instant) -> Self {
        Self {
            hash: record.hash.clone(),
            service: record.service,
            is_disabled: record.is_disabled,
            is_revoked: record.is_revoked,
            model_families: record.model_families.clone(),
            prompt_count: record.prompt_count,
            total_tokens: record.total_tokens(),
            last_used_ms_ago: record
                .last_used
                .map(|t| now.saturating_duration_since(t).as_millis() as u64),
            last_checked_ms_ago: record
                .last_checked
                .map(|t| now.saturating_duration_since(t).as_millis() as u64),
            rate_limited_for_ms: record.rate_limited_until.and_then(|until| {
                let remaining = until.saturating_duration_since(now);
                if remaining.is_zero() {
                    None
                } else {
                    Some(remaining.as_millis() as u64)
                }
            }),
        }
    }
}

/// Patch applied through a provider's `update` path. The checker and the
/// response pipeline never hold a mutable record reference.
#[derive(Debug, Default, Clone)]
pub struct KeyPatch {
    pub model_families: Option<BTreeSet<String>>,
    pub disabled: Option<bool>,
    pub revoked: Option<bool>,
    pub tier: Option<AnthropicTier>,
    pub model_ids: Option<Vec<String>>,
}

impl KeyPatch {
    pub fn revoke() -> Self {
        Self {
            disabled: Some(true),
            revoked: Some(true),
            ..Self::default()
        }
    }

    pub fn families<I: IntoIterator<Item = String>>(families: I) -> Self {
        Self {
            model_families: Some(families.into_iter().collect()),
            ..Self::default()
        }
    }
}

/// A credential handed to the request pipeline for a single dispatch.
#[derive(Clone)]
pub struct BoundKey {
    pub hash: String,
    pub service: Service,
    pub secret: Secret<String>,
}

impl fmt::Debug for BoundKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundKey")
            .field("hash", &self.hash)
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}
