//! Environment-based configuration overrides.
//!
//! The key lists (`OPENAI_KEY`, `ANTHROPIC_KEY`, `GOOGLE_AI_KEY`) are
//! comma-separated secret lists; everything else is a scalar override on the
//! file-based configuration.

use crate::config::AppConfig;
use std::env;

/// Split a comma-separated secret list, dropping empty fragments.
fn split_key_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_bool(name: &str) -> Option<bool> {
    env::var(name).ok().and_then(|v| {
        match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        }
    })
}

fn env_u64(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Apply recognised environment variables on top of `config`.
///
/// Returns the list of variables that were applied, for startup logging.
pub fn apply_env_overrides(config: &mut AppConfig) -> Vec<&'static str> {
    let mut applied = Vec::new();

    if let Ok(raw) = env::var("OPENAI_KEY") {
        config.services.openai.keys = split_key_list(&raw);
        applied.push("OPENAI_KEY");
    }
    if let Ok(raw) = env::var("ANTHROPIC_KEY") {
        config.services.anthropic.keys = split_key_list(&raw);
        applied.push("ANTHROPIC_KEY");
    }
    if let Ok(raw) = env::var("GOOGLE_AI_KEY") {
        config.services.google_ai.keys = split_key_list(&raw);
        applied.push("GOOGLE_AI_KEY");
    }

    if let Ok(url) = env::var("OPENAI_BASE_URL") {
        config.services.openai.base_url = Some(url);
        applied.push("OPENAI_BASE_URL");
    }
    if let Ok(url) = env::var("ANTHROPIC_BASE_URL") {
        config.services.anthropic.base_url = Some(url);
        applied.push("ANTHROPIC_BASE_URL");
    }
    if let Ok(url) = env::var("GOOGLE_AI_BASE_URL") {
        config.services.google_ai.base_url = Some(url);
        applied.push("GOOGLE_AI_BASE_URL");
    }

    if let Some(v) = env_bool("CHECK_KEYS") {
        config.check_keys = v;
        applied.push("CHECK_KEYS");
    }
    if let Some(v) = env_bool("PROMPT_LOGGING") {
        config.prompt_logging = v;
        applied.push("PROMPT_LOGGING");
    }
    if let Some(v) = env_u64("PORT") {
        config.server.port = v as u16;
        applied.push("PORT");
    }

    for (var, target) in [
        (
            "OPENAI_RATE_LIMIT_LOCKOUT_MS",
            &mut config.services.openai.rate_limit_lockout_ms,
        ),
        (
            "ANTHROPIC_RATE_LIMIT_LOCKOUT_MS",
            &mut config.services.anthropic.rate_limit_lockout_ms,
        ),
        (
            "GOOGLE_AI_RATE_LIMIT_LOCKOUT_MS",
            &mut config.services.google_ai.rate_limit_lockout_ms,
        ),
    ] {
        if let Some(v) = env_u64(var) {
            *target = v;
        }
    }
    for (var, target) in [
        (
            "OPENAI_KEY_REUSE_DELAY_MS",
            &mut config.services.openai.key_reuse_delay_ms,
        ),
        (
            "ANTHROPIC_KEY_REUSE_DELAY_MS",
            &mut config.services.anthropic.key_reuse_delay_ms,
        ),
        (
            "GOOGLE_AI_KEY_REUSE_DELAY_MS",
            &mut config.services.google_ai.key_reuse_delay_ms,
        ),
    ] {
        if let Some(v) = env_u64(var) {
            *target = v;
        }
    }

    applied
}
