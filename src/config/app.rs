// src/config/app.rs

use serde::{Deserialize, Serialize};

/// Per-upstream-service settings: the credential list and the pacing knobs
/// used by that service's key provider.
#[derive(Debug, Deserialize, Clone, PartialEq, Serialize)]
pub struct ServiceConfig {
    /// Comma-splittable credential list. Deduplicated by exact string at
    /// provider construction.
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Window after a 429 during which a key ranks below non-limited keys.
    #[serde(default = "default_rate_limit_lockout_ms")]
    pub rate_limit_lockout_ms: u64,
    /// Post-selection throttle preventing a burst from pinning one key.
    #[serde(default = "default_key_reuse_delay_ms")]
    pub key_reuse_delay_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            keys: Vec::new(),
            base_url: None,
            rate_limit_lockout_ms: default_rate_limit_lockout_ms(),
            key_reuse_delay_ms: default_key_reuse_delay_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Default, Serialize)]
pub struct ServicesConfig {
    #[serde(default)]
    pub openai: ServiceConfig,
    #[serde(default)]
    pub anthropic: ServiceConfig,
    #[serde(default, rename = "google-ai")]
    pub google_ai: ServiceConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Deadline for buffered upstream requests.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Deadline for streaming upstream requests.
    #[serde(default = "default_streaming_timeout")]
    pub streaming_timeout_secs: u64,
    /// How long a queue waits for the checker before draining waiters when
    /// every key looks unavailable but some are still unchecked.
    #[serde(default = "default_unchecked_grace")]
    pub unchecked_grace_secs: u64,
    /// Bound on 429-driven redispatches of a single request.
    #[serde(default = "default_max_retries")]
    pub max_rate_limit_retries: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            streaming_timeout_secs: default_streaming_timeout(),
            unchecked_grace_secs: default_unchecked_grace(),
            max_rate_limit_retries: default_max_retries(),
        }
    }
}

/// A model-name prefix mapped to the service that owns it.
#[derive(Debug, Deserialize, Clone, PartialEq, Serialize)]
pub struct RoutePrefix {
    pub prefix: String,
    pub service: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub services: ServicesConfig,
    /// Probe keys in the background; disabled keys fall back to the
    /// service's default model families.
    #[serde(default = "default_true")]
    pub check_keys: bool,
    #[serde(default)]
    pub prompt_logging: bool,
    /// Extra model-prefix routes merged over the built-in table.
    #[serde(default)]
    pub route_prefixes: Vec<RoutePrefix>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            services: ServicesConfig::default(),
            check_keys: true,
            prompt_logging: false,
            route_prefixes: Vec::new(),
        }
    }
}

// Default value functions
fn default_port() -> u16 {
    7860
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    60
}

fn default_streaming_timeout() -> u64 {
    300
}

fn default_unchecked_grace() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_rate_limit_lockout_ms() -> u64 {
    2000
}

fn default_key_reuse_delay_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}
