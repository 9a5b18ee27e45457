// src/config/mod.rs

pub mod app;
pub mod environment;
pub mod validation;

pub use app::{AppConfig, RoutePrefix, ServerConfig, ServiceConfig, ServicesConfig};

use crate::error::Result;
use std::path::Path;
use tracing::info;

/// Load configuration: optional YAML file, then environment overrides, then
/// validation.
///
/// # Errors
///
/// Returns an error when the file exists but cannot be parsed, or when the
/// merged configuration fails validation (`NoKeysConfigured` when no service
/// has any keys).
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let mut config = if path.exists() {
        let raw = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&raw)?
    } else {
        AppConfig::default()
    };

    let applied = environment::apply_env_overrides(&mut config);
    if !applied.is_empty() {
        info!(overrides = ?applied, "Applied environment configuration overrides");
    }

    validation::validate(&config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn missing_file_falls_back_to_defaults_plus_env() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.yaml");
        // No keys anywhere: must fail validation, not file loading.
        // (Guarded: only meaningful when the *_KEY vars are not exported.)
        if std::env::var("OPENAI_KEY").is_err()
            && std::env::var("ANTHROPIC_KEY").is_err()
            && std::env::var("GOOGLE_AI_KEY").is_err()
        {
            assert!(load_config(&path).is_err());
        }
    }

    #[test]
    fn yaml_file_is_parsed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            concat!(
                "server:\n",
                "  port: 9000\n",
                "services:\n",
                "  anthropic:\n",
                "    keys: [\"sk-ant-1\", \"sk-ant-2\"]\n",
            ),
        )
        .unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.services.anthropic.keys.len(), 2);
        assert_eq!(config.services.anthropic.rate_limit_lockout_ms, 2000);
        assert_eq!(config.services.anthropic.key_reuse_delay_ms, 500);
    }
}
