//! Axum router construction.
//!
//! [`build`] assembles the complete application router:
//! - per-request trace-ID middleware
//! - health route
//! - upload and status routes under `/scan`

mod health;
mod scan;

use std::sync::Arc;

use axum::{middleware, Router};
use sbom_core::TaskLedger;

use crate::middleware::trace;
use crate::state::AppState;

/// Build the complete Axum [`Router`] for the application.
pub fn build<L: TaskLedger>(state: Arc<AppState<L>>) -> Router {
    Router::new()
        .merge(health::router())
        .merge(scan::router())
        .layer(middleware::from_fn(trace::trace_middleware))
        .with_state(state)
}
