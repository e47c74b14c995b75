//! Health / heartbeat endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use sbom_core::TaskLedger;
use serde_json::{json, Value};
use tracing::warn;

use crate::state::AppState;

/// Register health-check routes.
pub fn router<L: TaskLedger>() -> Router<Arc<AppState<L>>> {
    Router::new().route("/health", get(get_health::<L>))
}

/// Heartbeat endpoint.
///
/// Returns `{"status": "ok", "version": "...", "tasks": {...}}` with HTTP 200
/// while the ledger answers, and `"degraded"` with HTTP 503 otherwise.
pub async fn get_health<L: TaskLedger>(
    State(state): State<Arc<AppState<L>>>,
) -> (StatusCode, Json<Value>) {
    match state.ledger.status_counts().await {
        Ok(tasks) => (
            StatusCode::OK,
            Json(json!({
                "status":  "ok",
                "version": env!("CARGO_PKG_VERSION"),
                "tasks":   tasks,
            })),
        ),
        Err(e) => {
            warn!(error = %e, "health check: ledger unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status":  "degraded",
                    "version": env!("CARGO_PKG_VERSION"),
                })),
            )
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
