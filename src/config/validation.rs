//! Configuration validation

use crate::config::AppConfig;
use crate::error::{AppError, Result};
use url::Url;

/// Validate a loaded configuration.
///
/// # Errors
///
/// Returns `NoKeysConfigured` when every service's key list is empty, and
/// `ConfigValidation` for malformed base URLs or route prefixes.
pub fn validate(config: &AppConfig) -> Result<()> {
    let total_keys = config.services.openai.keys.len()
        + config.services.anthropic.keys.len()
        + config.services.google_ai.keys.len();
    if total_keys == 0 {
        return Err(AppError::NoKeysConfigured);
    }

    for (name, service) in [
        ("openai", &config.services.openai),
        ("anthropic", &config.services.anthropic),
        ("google-ai", &config.services.google_ai),
    ] {
        if let Some(url) = &service.base_url {
            Url::parse(url).map_err(|e| AppError::ConfigValidation {
                message: format!("invalid base_url for service {name}: {e}"),
            })?;
        }
    }

    for route in &config.route_prefixes {
        if route.prefix.is_empty() {
            return Err(AppError::ConfigValidation {
                message: "route_prefixes entries must have a non-empty prefix".to_string(),
            });
        }
        if !matches!(route.service.as_str(), "openai" | "anthropic" | "google-ai") {
            return Err(AppError::ConfigValidation {
                message: format!("route prefix '{}' names unknown service '{}'", route.prefix, route.service),
            });
        }
    }

    Ok(())
}
