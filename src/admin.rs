// src/admin.rs

use crate::state::AppState;
use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;

pub fn admin_routes() -> Router<Arc<AppState>> {
    Router::new().route("/admin/keys", get(list_keys))
}

/// Redacted key listing with per-service quota diagnostics. Secrets never
/// appear here; records are identified by their public hash.
async fn list_keys(State(state): State<Arc<AppState>>) -> Json<Value> {
    let services: Vec<Value> = state
        .pool
        .services()
        .into_iter()
        .filter_map(|service| state.pool.provider(service))
        .map(|provider| {
            json!({
                "service": provider.service(),
                "available": provider.available(),
                "any_unchecked": provider.any_unchecked(),
                "remaining_quota": provider.remaining_quota(),
                "usage": provider.usage_in_usd(),
                "keys": provider.list(),
            })
        })
        .collect();

    Json(json!({
        "generated_at": chrono::Utc::now().to_rfc3339(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "services": services,
    }))
}
