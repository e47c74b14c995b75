//! sbom-server – entry point.
//!
//! Startup order:
//! 1. Parse configuration from environment variables.
//! 2. Initialise structured tracing (JSON in production, pretty in dev).
//! 3. Connect to PostgreSQL and run pending migrations.
//! 4. Create the blob directories on the shared volume.
//! 5. Start the worker scheduler and the janitor in background tasks.
//! 6. Build the Axum router and serve HTTP until SIGINT / SIGTERM.
//! 7. Stop the background loops and wait for in-flight scans to drain.

mod config;
mod error;
mod middleware;
mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use sbom_core::{BlobStore, Janitor, PgLedger, Scheduler};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cfg = Config::from_env();

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: SBOM_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true);

    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "sbom-server starting");

    // ── 3. Database ────────────────────────────────────────────────────────────
    let ledger = Arc::new(PgLedger::connect(&cfg.database_url, cfg.db_max_connections).await?);
    info!(max_connections = cfg.db_max_connections, "ledger ready");

    // ── 4. Blob store ──────────────────────────────────────────────────────────
    let blobs = BlobStore::new(&cfg.upload_dir);
    blobs.ensure().await?;
    info!(upload_dir = %cfg.upload_dir.display(), "blob store ready");

    // ── 5. Background loops ────────────────────────────────────────────────────
    let shutdown = CancellationToken::new();

    let scheduler = Scheduler::new(
        Arc::clone(&ledger),
        blobs.clone(),
        cfg.processor(),
        cfg.scheduler(),
    );
    let scheduler_token = shutdown.child_token();
    let scheduler_task = tokio::spawn(async move { scheduler.run(scheduler_token).await });

    let janitor = Janitor::new(Arc::clone(&ledger), blobs.clone(), cfg.janitor());
    let janitor_token = shutdown.child_token();
    let janitor_task = tokio::spawn(async move { janitor.run(janitor_token).await });

    // ── 6. HTTP server with graceful shutdown ──────────────────────────────────
    let state = Arc::new(AppState {
        config: Arc::new(cfg.clone()),
        ledger,
        blobs,
    });
    let app = routes::build(state);
    let addr: SocketAddr = cfg.bind_address.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    // The background loops stop claiming as soon as the signal arrives,
    // while HTTP connections are still draining.
    let signal_token = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            signal_token.cancel();
        })
        .await;

    // ── 7. Drain ───────────────────────────────────────────────────────────────
    shutdown.cancel();
    match scheduler_task.await {
        Ok(report) if report.drained => info!("in-flight scans finished"),
        Ok(report) => warn!(
            abandoned = report.abandoned,
            "scans abandoned at shutdown; the janitor will reap them"
        ),
        Err(e) => warn!(error = %e, "scheduler task panicked"),
    }
    if let Err(e) = janitor_task.await {
        warn!(error = %e, "janitor task panicked");
    }

    served?;
    info!("sbom-server stopped");
    Ok(())
}

/// Returns a future that resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}
