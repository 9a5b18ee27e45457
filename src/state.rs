// src/state.rs

use crate::config::AppConfig;
use crate::error::{AppError, Result};
use crate::handlers::{self, ResponseHandler};
use crate::keys::checker::KeyChecker;
use crate::keys::pool::KeyPool;
use crate::keys::record::KeyPatch;
use crate::queue::RequestQueues;
use reqwest::Client;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::info;

/// Shared application state, accessible by all axum handlers.
pub struct AppState {
    pub config: AppConfig,
    pub pool: Arc<KeyPool>,
    pub queues: RequestQueues,
    pub http_client: Client,
    pub response_handlers: Vec<Box<dyn ResponseHandler>>,
    pub start_time: Instant,
    /// Cached `/v1/models` listing with its build time.
    pub models_cache: Mutex<Option<(Instant, Value)>>,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("services", &self.pool.services())
            .field("start_time", &self.start_time)
            .finish_non_exhaustive()
    }
}

fn build_http_client(config: &AppConfig) -> Result<Client> {
    let total_keys = config.services.openai.keys.len()
        + config.services.anthropic.keys.len()
        + config.services.google_ai.keys.len();
    Client::builder()
        .connect_timeout(Duration::from_secs(config.server.connect_timeout_secs))
        .pool_max_idle_per_host(total_keys.max(10))
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .build()
        .map_err(|e| AppError::internal(format!("failed to build HTTP client: {e}")))
}

impl AppState {
    /// Build the pool, queues, and HTTP client, and start the background
    /// checkers (unless `CHECK_KEYS` is off, in which case every key claims
    /// its service's default families immediately).
    pub async fn new(config: &AppConfig) -> Result<Self> {
        let http_client = build_http_client(config)?;
        let pool = Arc::new(KeyPool::new(config));

        if config.check_keys {
            for service in pool.services() {
                if let Some(provider) = pool.provider(service) {
                    KeyChecker::new(Arc::clone(provider)).start();
                }
            }
        } else {
            info!("CHECK_KEYS disabled; keys assume default model families");
            for service in pool.services() {
                if let Some(provider) = pool.provider(service) {
                    let families = provider.default_families();
                    for (hash, _) in provider.checkable_keys() {
                        provider.update(&hash, KeyPatch::families(families.clone()));
                    }
                }
            }
        }

        let queues = RequestQueues::new(
            &pool,
            Duration::from_secs(config.server.unchecked_grace_secs),
        );

        Ok(Self {
            config: config.clone(),
            pool,
            queues,
            http_client,
            response_handlers: handlers::default_handlers(),
            start_time: Instant::now(),
            models_cache: Mutex::new(None),
        })
    }
}
