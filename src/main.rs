// src/main.rs

use axum::serve;
use llm_key_proxy::{run, AppError};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// JSON logs by default; `LOG_PRETTY=1` switches to human-readable output
/// for local debugging.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn"));
    let pretty = std::env::var("LOG_PRETTY")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let registry = tracing_subscriber::registry().with(filter);
    if pretty {
        registry.with(fmt::layer()).init();
    } else {
        registry
            .with(fmt::layer().json().with_current_span(true))
            .init();
    }
}

/// Resolves on SIGINT or SIGTERM. A broken signal handler downgrades to the
/// other signal instead of aborting startup.
async fn wait_for_shutdown() {
    let interrupt = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Interrupt handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => info!(signal = "SIGINT", "Shutdown requested; draining in-flight requests"),
        () = terminate => info!(signal = "SIGTERM", "Shutdown requested; draining in-flight requests"),
    }
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    init_tracing();

    let (app, config) = run(None).await?;

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = TcpListener::bind(addr).await?;
    info!(
        address = %addr,
        keys.openai = config.services.openai.keys.len(),
        keys.anthropic = config.services.anthropic.keys.len(),
        keys.google_ai = config.services.google_ai.keys.len(),
        check_keys = config.check_keys,
        prompt_logging = config.prompt_logging,
        "Accepting client traffic"
    );

    serve(listener, app.into_make_service())
        .with_graceful_shutdown(wait_for_shutdown())
        .await?;

    info!("All connections drained; exiting");
    Ok(())
}
