// src/lib.rs

pub mod admin;
pub mod config;
pub mod context;
pub mod dialect;
pub mod error;
pub mod handler;
pub mod handlers;
pub mod keys;
pub mod metrics;
pub mod preprocess;
pub mod queue;
pub mod state;
pub mod tokenizer;
pub mod upstream;

use axum::{
    body::Body,
    http::Request as AxumRequest,
    middleware::{self, Next},
    response::Response as AxumResponse,
    routing::{get, post},
    Router,
};
use crate::context::CorrelationId;
use std::{path::PathBuf, sync::Arc, time::Instant};
use tracing::{error, info, span, Instrument, Level};

pub use config::AppConfig;
pub use error::{AppError, Result};
pub use state::AppState;

/// Creates the main Axum router for the application.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handler::health_check))
        .route("/metrics", get(metrics::metrics_handler))
        .merge(admin::admin_routes())
        .route("/v1/models", get(handler::list_models))
        .route("/v1/chat/completions", post(handler::chat_completions))
        .route("/v1/completions", post(handler::text_completions))
        .route("/v1/images/generations", post(handler::image_generations))
        .route("/v1/complete", post(handler::anthropic_complete))
        .route("/v1/messages", post(handler::anthropic_messages))
        .route("/v1/claude-3/complete", post(handler::claude3_complete))
        .with_state(state)
}

/// Edge middleware: mints the request's correlation id, parks it in the
/// request extensions for the pipeline to pick up, and wraps the request in
/// a span keyed on the same id. Error responses echo this id back to the
/// client, so one value ties together the span, the pipeline logs, and
/// whatever the client reports.
async fn trace_requests(mut req: AxumRequest<Body>, next: Next) -> AxumResponse {
    let correlation_id = CorrelationId::new();
    req.extensions_mut().insert(correlation_id);

    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let span = span!(
        Level::INFO,
        "proxy_request",
        correlation_id = %correlation_id,
        method = %method,
        path = %path,
    );
    let response = next.run(req).instrument(span).await;

    info!(
        correlation_id = %correlation_id,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Request served"
    );
    response
}

/// The main application setup function: configuration, state initialization,
/// and router creation.
///
/// # Errors
///
/// Returns an error when configuration loading or validation fails (notably
/// `NoKeysConfigured` when every key list is empty), or when the application
/// state cannot be initialized.
pub async fn run(
    config_path_override: Option<PathBuf>,
) -> std::result::Result<(Router, AppConfig), AppError> {
    let config_path = config_path_override.unwrap_or_else(|| {
        std::env::var("CONFIG_PATH").map_or_else(|_| PathBuf::from("config.yaml"), PathBuf::from)
    });

    info!("Starting multi-provider key rotation proxy...");
    metrics::init();

    let config_path_display = config_path.display().to_string();
    if config_path.exists() {
        info!(config.path = %config_path_display, "Using configuration file");
    } else {
        info!(config.path = %config_path_display, "Optional configuration file not found. Using defaults and environment variables.");
    }

    let app_config = config::load_config(&config_path).map_err(|e| {
        error!(
            config.path = %config_path_display,
            error = ?e,
            "Failed to load or validate configuration. Exiting."
        );
        e
    })?;

    let key_counts = [
        ("openai", app_config.services.openai.keys.len()),
        ("anthropic", app_config.services.anthropic.keys.len()),
        ("google-ai", app_config.services.google_ai.keys.len()),
    ];
    info!(
        config.keys = ?key_counts,
        config.check_keys = app_config.check_keys,
        server.port = app_config.server.port,
        "Configuration loaded and validated successfully."
    );

    let app_state = AppState::new(&app_config).await.map_err(|e| {
        error!(error = ?e, "Failed to initialize application state. Exiting.");
        e
    })?;
    let app_state = Arc::new(app_state);

    let app = create_router(app_state).layer(middleware::from_fn(trace_requests));

    Ok((app, app_config))
}
