//! Application entry point for the `microclimate-ingest` service.
//!
//! This binary orchestrates the full lifecycle of the sensor ingestion
//! pipeline, including:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Connecting to PostgreSQL (storage) and Redis (real-time channel)
//! - Starting the worker pool and batch accumulator
//! - Serving the ingress routes via the `routes` gateway (EMBP pattern)
//! - Draining the pipeline on SIGINT/SIGTERM within a bounded grace period
//!
//! # Environment Variables
//! - `DATABASE_URL` (**required**) – PostgreSQL connection string
//! - `REDIS_URL` (optional) – Redis connection string
//! - `AXUM_LOG_LEVEL` (optional) – log verbosity (default: `debug`)
//! - `AXUM_SPAN_EVENTS` (optional) – span event mode for tracing
//!
//! See `config.rs` for the pipeline tuning variables.
//!
//! This module follows the Explicit Module Boundary Pattern (EMBP) by
//! delegating configuration parsing to `config`, pipeline internals to
//! `pipeline`, and route registration to `routes`.
use std::{env, io::IsTerminal, net::SocketAddr, sync::Arc};

use axum::Router;
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use tokio::{signal, sync::watch};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use anyhow::{Context, Result};

mod config;
mod error;
mod models;
mod pipeline;
mod publish;
mod routes;
mod store;

#[cfg(test)]
mod testing;

pub use config::Config;

// These are re-exported here so sibling modules only depend on their parent
// (main.rs) and never on each other's file layout.
pub use error::IngestError;
pub use models::SensorReading;
pub use pipeline::{
    Calibrator, IdentityCalibration, Ingestor, PipelineDeps, PipelineSettings, StatsSnapshot,
};
pub use publish::{ReadingPublisher, RedisPublisher};
pub use store::{BatchOutcome, PgReadingStore, ReadingStore};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    init_tracing();
    dotenv().ok();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    tracing::info!("Attempting to connect to database");

    let pool = PgPoolOptions::new()
        .max_connections(cfg.db_pool_max)
        .connect(&cfg.db_url)
        .await
        .context("Failed to connect to database")?;

    tracing::info!("Successfully connected to database");

    let publisher = RedisPublisher::connect(&cfg.redis_url, &cfg.publish_channel)
        .await
        .context("Failed to connect to Redis")?;

    tracing::info!("Successfully connected to Redis");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let calibrator: Arc<dyn Calibrator> = Arc::new(IdentityCalibration);
    let (ingestor, pipeline) = pipeline::start(
        PipelineSettings::from(&cfg),
        PipelineDeps {
            publisher: Arc::new(publisher),
            store: Arc::new(PgReadingStore::new(pool.clone(), cfg.batch_max)),
            calibrator,
        },
        shutdown_rx,
    );

    // Build app from routes gateway (EMBP)
    let app: Router = routes::router(ingestor);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // HTTP is closed, so no new readings can arrive. Drain the pipeline.
    tracing::info!("Shutting down ingestion pipeline...");
    request_shutdown(&shutdown_tx);
    if let Err(e) = pipeline.wait(cfg.shutdown_grace).await {
        tracing::error!(error = %e, "Pipeline shutdown incomplete");
    }

    pool.close().await;
    tracing::info!("Server exited");
    Ok(())
}

// ---

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `AXUM_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level controlled by `RUST_LOG`, or else the `AXUM_LOG_LEVEL` env var
///
/// This should be called once at application startup before any logging
/// or tracing macros are invoked.
fn init_tracing() {
    // ---
    let span_events = match env::var("AXUM_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("AXUM_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}

/// Flip the pipeline's shutdown channel. Returns `false` if no task was
/// listening any more.
fn request_shutdown(tx: &watch::Sender<bool>) -> bool {
    // ---
    match tx.send(true) {
        Ok(()) => true,
        Err(_) => {
            tracing::debug!("Pipeline tasks already gone, nothing to signal");
            false
        }
    }
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() {
    // ---
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = ?e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = ?e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
