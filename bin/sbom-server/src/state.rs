//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use sbom_core::BlobStore;

use crate::config::Config;

/// State shared across all HTTP handlers.
///
/// Generic over the ledger so handlers can be exercised against the
/// in-memory implementation.
#[derive(Debug)]
pub struct AppState<L> {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// Authoritative task state.
    pub ledger: Arc<L>,
    /// Shared upload volume.
    pub blobs: BlobStore,
}
