//! CoinFlow - resilient multi-source crypto market-data ETL backend.
//!
//! Pulls snapshots from two JSON APIs and a CSV archive, normalizes them
//! into a unified shape, and persists a raw mirror plus a normalized view
//! with crash-safe batch checkpoints.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use coinflow_backend::{
    api::{create_router, AppState},
    config::Config,
    etl::{Orchestrator, RateGate, RecordFetcher, SchemaMapper, SourceExtractor},
    metrics::EtlMetrics,
    middleware::request_logging,
    scheduler,
    storage::{CheckpointStore, RecordStore, RunLedger},
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        db = %config.database_path,
        port = config.port,
        batch_size = config.batch_size,
        "CoinFlow ETL backend starting"
    );
    if config.fault_injection {
        warn!("fault injection is ENABLED, runs will fail synthetically");
    }

    // Persistence: one SQLite file, three store handles.
    let store = Arc::new(
        RecordStore::open(&config.database_path).context("Failed to open record store")?,
    );
    let checkpoints = Arc::new(
        CheckpointStore::open(&config.database_path).context("Failed to open checkpoint store")?,
    );
    let ledger = Arc::new(
        RunLedger::open(&config.database_path).context("Failed to open run ledger")?,
    );

    let metrics = Arc::new(EtlMetrics::new());
    let gate = Arc::new(RateGate::new(
        config.rate_limits.clone(),
        Arc::clone(&metrics),
    ));
    let mapper = Arc::new(SchemaMapper::new());
    let extractor: Arc<dyn RecordFetcher> = Arc::new(SourceExtractor::new(
        &config,
        gate,
        Arc::clone(&metrics),
    ));

    let shutdown = Arc::new(AtomicBool::new(false));
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store),
        Arc::clone(&checkpoints),
        Arc::clone(&ledger),
        extractor,
        mapper,
        Arc::clone(&metrics),
        config.batch_size,
        config.fault_injection,
        Arc::clone(&shutdown),
    ));

    let scheduler_handle = scheduler::spawn(
        Arc::clone(&orchestrator),
        config.etl_interval_secs,
        Arc::clone(&shutdown),
    );

    let state = AppState {
        orchestrator,
        store,
        ledger,
        metrics,
        scheduler_enabled: scheduler_handle.is_some(),
    };

    let app = create_router(state)
        .layer(axum::middleware::from_fn(request_logging))
        .layer(tower_http::cors::CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("API listening on {addr}");

    let shutdown_flag = Arc::clone(&shutdown);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "shutdown signal listener failed");
                return;
            }
            // In-flight runs stop at the next batch boundary and keep their
            // checkpoints, so the next start resumes.
            info!("shutdown signal received, draining");
            shutdown_flag.store(true, Ordering::Relaxed);
        })
        .await
        .context("API server error")?;

    if let Some(handle) = scheduler_handle {
        handle.abort();
    }
    info!("shutdown complete");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coinflow_backend=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
